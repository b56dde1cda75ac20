//! Boat performance curves: polar tables, optimal VMG targets and boat-class
//! angle profiles.

use ndarray::Array2;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::SailError;

const SWEEP_STEP_DEG: f64 = 0.5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Upwind,
    Reaching,
    Downwind,
}

impl Leg {
    /// Classify by absolute true wind angle.
    pub fn from_twa(twa_abs_deg: f64, upwind_max_deg: f64, downwind_min_deg: f64) -> Self {
        if twa_abs_deg < upwind_max_deg {
            Leg::Upwind
        } else if twa_abs_deg > downwind_min_deg {
            Leg::Downwind
        } else {
            Leg::Reaching
        }
    }
}

/// Best achievable VMG for a wind strength and leg.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct VmgTarget {
    pub twa_deg: f64,
    pub boat_speed_kn: f64,
    pub vmg_kn: f64,
}

/// Expected boat speed as a function of true wind speed and absolute TWA.
/// Any source (measured polars, class tables, fitted models) can back it.
pub trait PerformanceCurve: Send + Sync {
    fn boat_speed(&self, tws_kn: f64, twa_abs_deg: f64) -> f64;

    /// Absolute TWA range over which the curve is defined.
    fn twa_range(&self) -> (f64, f64);

    fn optimal_vmg(&self, tws_kn: f64, leg: Leg) -> Option<VmgTarget> {
        let (lo, hi) = self.twa_range();
        let (from, to) = match leg {
            Leg::Upwind => (lo.max(0.0), hi.min(90.0)),
            Leg::Downwind => (lo.max(90.0), hi.min(180.0)),
            Leg::Reaching => return None,
        };
        if from > to {
            return None;
        }
        let steps = ((to - from) / SWEEP_STEP_DEG).floor() as usize;
        (0..=steps)
            .map(|i| {
                let twa = from + i as f64 * SWEEP_STEP_DEG;
                let speed = self.boat_speed(tws_kn, twa);
                VmgTarget {
                    twa_deg: twa,
                    boat_speed_kn: speed,
                    vmg_kn: (speed * twa.to_radians().cos()).abs(),
                }
            })
            .max_by_key(|t| OrderedFloat(t.vmg_kn))
    }
}

/// Polar table on a (TWS × TWA) grid, read from
/// `{"tws_kn": [...], "twa_deg": [...], "target_kn": [[...], ...]}` where
/// `target_kn` has one row per TWS entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "PolarJson", into = "PolarJson")]
pub struct PolarTable {
    tws_kn: Vec<f64>,
    twa_deg: Vec<f64>,
    target_kn: Array2<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PolarJson {
    tws_kn: Vec<f64>,
    twa_deg: Vec<f64>,
    target_kn: Vec<Vec<f64>>,
}

impl TryFrom<PolarJson> for PolarTable {
    type Error = SailError;

    fn try_from(raw: PolarJson) -> Result<Self, Self::Error> {
        let rows = raw.target_kn.len();
        let cols = raw.twa_deg.len();
        if rows != raw.tws_kn.len() || raw.target_kn.iter().any(|r| r.len() != cols) {
            return Err(SailError::InvalidParameter(format!(
                "polar target_kn must be {}x{}",
                raw.tws_kn.len(),
                cols
            )));
        }
        let flat: Vec<f64> = raw.target_kn.into_iter().flatten().collect();
        let target = Array2::from_shape_vec((rows, cols), flat)
            .map_err(|e| SailError::InvalidParameter(e.to_string()))?;
        PolarTable::new(raw.tws_kn, raw.twa_deg, target)
    }
}

impl From<PolarTable> for PolarJson {
    fn from(table: PolarTable) -> Self {
        let target_kn = table
            .target_kn
            .outer_iter()
            .map(|row| row.to_vec())
            .collect();
        PolarJson {
            tws_kn: table.tws_kn,
            twa_deg: table.twa_deg,
            target_kn,
        }
    }
}

impl PolarTable {
    pub fn new(tws_kn: Vec<f64>, twa_deg: Vec<f64>, target_kn: Array2<f64>) -> Result<Self, SailError> {
        let increasing = |v: &[f64]| v.len() >= 2 && v.windows(2).all(|w| w[1] > w[0]);
        if !increasing(&tws_kn) || !increasing(&twa_deg) {
            return Err(SailError::InvalidParameter(
                "polar axes need at least two strictly increasing entries".into(),
            ));
        }
        if target_kn.dim() != (tws_kn.len(), twa_deg.len()) {
            return Err(SailError::InvalidParameter("polar grid shape mismatch".into()));
        }
        if target_kn.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(SailError::InvalidParameter(
                "polar speeds must be finite and non-negative".into(),
            ));
        }
        Ok(Self {
            tws_kn,
            twa_deg,
            target_kn,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, SailError> {
        serde_json::from_str(text).map_err(|e| SailError::InvalidParameter(e.to_string()))
    }

    /// Bilinear interpolation; inputs outside the grid are clamped to it.
    pub fn interpolate(&self, tws_kn: f64, twa_abs_deg: f64) -> f64 {
        let (i, ft) = bracket(&self.tws_kn, tws_kn);
        let (j, fa) = bracket(&self.twa_deg, twa_abs_deg);
        let v = &self.target_kn;
        v[[i, j]] * (1.0 - ft) * (1.0 - fa)
            + v[[i + 1, j]] * ft * (1.0 - fa)
            + v[[i, j + 1]] * (1.0 - ft) * fa
            + v[[i + 1, j + 1]] * ft * fa
    }
}

/// Lower grid index and fractional position of `x`, clamped to the grid.
fn bracket(grid: &[f64], x: f64) -> (usize, f64) {
    let last = grid.len() - 1;
    let x = x.clamp(grid[0], grid[last]);
    let i = grid.partition_point(|g| *g <= x).saturating_sub(1).min(last - 1);
    let span = grid[i + 1] - grid[i];
    (i, ((x - grid[i]) / span).clamp(0.0, 1.0))
}

impl PerformanceCurve for PolarTable {
    fn boat_speed(&self, tws_kn: f64, twa_abs_deg: f64) -> f64 {
        self.interpolate(tws_kn, twa_abs_deg)
    }

    fn twa_range(&self) -> (f64, f64) {
        (self.twa_deg[0], self.twa_deg[self.twa_deg.len() - 1])
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum WindBand {
    Light,
    Medium,
    Fresh,
    Strong,
}

impl WindBand {
    pub fn from_tws(tws_kn: f64) -> Self {
        if tws_kn < 6.0 {
            WindBand::Light
        } else if tws_kn < 12.0 {
            WindBand::Medium
        } else if tws_kn < 18.0 {
            WindBand::Fresh
        } else {
            WindBand::Strong
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct BandAngles {
    pub light: f64,
    pub medium: f64,
    pub fresh: f64,
    pub strong: f64,
}

impl BandAngles {
    pub fn get(&self, band: WindBand) -> f64 {
        match band {
            WindBand::Light => self.light,
            WindBand::Medium => self.medium,
            WindBand::Fresh => self.fresh,
            WindBand::Strong => self.strong,
        }
    }
}

/// Typical sailing angles for a boat class, used when no polar is available.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BoatClassProfile {
    pub name: String,
    pub upwind_twa: BandAngles,
    pub downwind_twa: BandAngles,
}

const BUILTIN_CLASSES: &[(&str, [f64; 4], [f64; 4])] = &[
    ("GP14", [42.0, 40.0, 38.0, 36.0], [150.0, 145.0, 140.0, 138.0]),
    ("Wayfarer", [44.0, 42.0, 40.0, 38.0], [152.0, 148.0, 144.0, 140.0]),
    ("Enterprise", [43.0, 41.0, 39.0, 37.0], [151.0, 146.0, 142.0, 138.0]),
    ("Mirror", [46.0, 44.0, 42.0, 40.0], [155.0, 150.0, 145.0, 142.0]),
    ("Laser", [40.0, 38.0, 35.0, 32.0], [148.0, 142.0, 138.0, 135.0]),
    ("Laser Radial", [42.0, 40.0, 37.0, 34.0], [150.0, 145.0, 140.0, 137.0]),
    ("420", [40.0, 38.0, 36.0, 33.0], [147.0, 142.0, 137.0, 134.0]),
    ("470", [38.0, 36.0, 34.0, 31.0], [145.0, 140.0, 135.0, 132.0]),
];

impl BoatClassProfile {
    pub fn builtin(name: &str) -> Option<Self> {
        BUILTIN_CLASSES
            .iter()
            .find(|(n, _, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|(n, up, down)| Self {
                name: n.to_string(),
                upwind_twa: bands(*up),
                downwind_twa: bands(*down),
            })
    }

    pub fn optimal_twa(&self, tws_kn: f64, leg: Leg) -> Option<f64> {
        let band = WindBand::from_tws(tws_kn);
        match leg {
            Leg::Upwind => Some(self.upwind_twa.get(band)),
            Leg::Downwind => Some(self.downwind_twa.get(band)),
            Leg::Reaching => None,
        }
    }
}

fn bands(v: [f64; 4]) -> BandAngles {
    BandAngles {
        light: v[0],
        medium: v[1],
        fresh: v[2],
        strong: v[3],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn demo_polar() -> PolarTable {
        PolarTable::new(
            vec![6.0, 12.0],
            vec![30.0, 60.0, 90.0, 150.0, 180.0],
            array![[3.0, 4.5, 5.0, 4.0, 3.5], [5.0, 6.5, 7.0, 6.5, 5.5]],
        )
        .unwrap()
    }

    #[test]
    fn bilinear_hits_corners_and_midpoints() {
        let p = demo_polar();
        assert_eq!(p.interpolate(6.0, 30.0), 3.0);
        assert_eq!(p.interpolate(12.0, 90.0), 7.0);
        assert!((p.interpolate(9.0, 45.0) - (3.0 + 4.5 + 5.0 + 6.5) / 4.0).abs() < 1e-9);
    }

    #[test]
    fn clamps_outside_grid() {
        let p = demo_polar();
        assert_eq!(p.interpolate(2.0, 10.0), 3.0);
        assert_eq!(p.interpolate(30.0, 180.0), 5.5);
    }

    #[test]
    fn parses_json_layout() {
        let p = PolarTable::from_json(
            r#"{"tws_kn":[6,12],"twa_deg":[30,60,90,150,180],
                "target_kn":[[3,4.5,5,4,3.5],[5,6.5,7,6.5,5.5]]}"#,
        )
        .unwrap();
        assert_eq!(p, demo_polar());
        let back = serde_json::to_string(&p).unwrap();
        assert!(back.contains("\"target_kn\":[[3.0,4.5"));
    }

    #[test]
    fn rejects_ragged_grid() {
        let err = PolarTable::from_json(r#"{"tws_kn":[6,12],"twa_deg":[30,60],"target_kn":[[1,2],[3]]}"#);
        assert!(err.is_err());
    }

    #[test]
    fn constant_speed_polar_targets_tightest_angle() {
        let p = PolarTable::new(
            vec![0.0, 30.0],
            vec![35.0, 90.0, 180.0],
            Array2::from_elem((2, 3), 6.0),
        )
        .unwrap();
        let up = p.optimal_vmg(10.0, Leg::Upwind).unwrap();
        assert_eq!(up.twa_deg, 35.0);
        assert!((up.vmg_kn - 6.0 * 35f64.to_radians().cos()).abs() < 1e-9);
        let down = p.optimal_vmg(10.0, Leg::Downwind).unwrap();
        assert_eq!(down.twa_deg, 180.0);
        assert!((down.vmg_kn - 6.0).abs() < 1e-9);
        assert!(p.optimal_vmg(10.0, Leg::Reaching).is_none());
    }

    #[test]
    fn class_profile_by_band() {
        let laser = BoatClassProfile::builtin("laser").unwrap();
        assert_eq!(laser.optimal_twa(4.0, Leg::Upwind), Some(40.0));
        assert_eq!(laser.optimal_twa(15.0, Leg::Downwind), Some(138.0));
        assert!(BoatClassProfile::builtin("Optimist").is_none());
        assert_eq!(WindBand::from_tws(12.0), WindBand::Fresh);
    }
}
