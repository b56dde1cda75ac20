//! Sailing telemetry analytics implemented in Rust.
//!
//! Raw position/heading/speed/wind fixes go in; normalized series, tactical
//! snapshots, maneuvers, wind patterns, performance anomalies and fleet
//! rankings come out. Every derived record is a pure function of its inputs
//! and the [`Params`] it was computed with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod baseline;
pub mod fleet;
pub mod geo;
pub mod ingest;
pub mod maneuver;
pub mod normalize;
pub mod pipeline;
pub mod polar;
pub mod tactics;
pub mod wind;

pub use baseline::{
    build_baseline, detect_anomalies, AnomalyReport, BaselineParams, BaselineSet, BaselineStore,
    CancelFlag, HistoricalSession,
};
pub use fleet::{compare_fleet, head_to_head, FleetComparisonResult, FleetEntry, FleetParams};
pub use ingest::parse_fixes;
pub use maneuver::{detect_maneuvers, Maneuver, ManeuverKind, ManeuverParams, ManeuverReport};
pub use normalize::{normalize, NormalizeParams, Sample, TelemetrySeries};
pub use pipeline::{analyze_session, analyze_sessions, CourseConfig, SessionAnalysis, SessionInput};
pub use polar::{BoatClassProfile, PerformanceCurve, PolarTable};
pub use tactics::{TacticalSnapshot, TacticsParams};
pub use wind::{analyze_wind, WindAnalysis, WindParams};

#[derive(Error, Debug)]
pub enum SailError {
    #[error("malformed telemetry fix: {0}")]
    MalformedInput(String),
    #[error("insufficient data for {stage}: have {have}, need {need}")]
    InsufficientData {
        stage: &'static str,
        have: usize,
        need: usize,
    },
    #[error("no wind estimate available: {0}")]
    MissingWindData(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to parse FIT file: {0}")]
    FitParse(String),
    #[error("failed to parse GPX file: {0}")]
    GpxParse(String),
    #[error("failed to parse CSV telemetry: {0}")]
    CsvParse(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("baseline store unavailable: {0}")]
    BaselineStore(String),
}

/// A latitude/longitude pair in decimal degrees.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// True wind as reported by an external source (committee boat, weather feed).
/// `direction_deg` is where the wind blows from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindReading {
    pub direction_deg: f64,
    pub speed_kn: f64,
}

/// Apparent wind measured aboard. `angle_deg` is the bearing relative to the
/// bow, clockwise positive (starboard side).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ApparentWind {
    pub angle_deg: f64,
    pub speed_kn: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TelemetryFix {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub heading_deg: Option<f64>,
    pub sog_kn: f64,
    pub cog_deg: f64,
    #[serde(default)]
    pub wind: Option<WindReading>,
    #[serde(default)]
    pub apparent: Option<ApparentWind>,
}

impl TelemetryFix {
    pub fn new(timestamp: DateTime<Utc>, lat: f64, lon: f64, sog_kn: f64, cog_deg: f64) -> Self {
        Self {
            timestamp,
            lat,
            lon,
            heading_deg: None,
            sog_kn,
            cog_deg,
            wind: None,
            apparent: None,
        }
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// Why a derived value could not be computed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Undefined {
    MissingWind,
    ReachingLeg,
    NoMark,
    NoStartLine,
    NotClosing,
    CountdownNotStarted,
    Stationary,
}

/// A derived value that is either computed or explicitly undefined.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Metric<T> {
    Defined(T),
    Undefined(Undefined),
}

impl<T> Metric<T> {
    pub fn defined(&self) -> Option<&T> {
        match self {
            Metric::Defined(v) => Some(v),
            Metric::Undefined(_) => None,
        }
    }

    pub fn reason(&self) -> Option<Undefined> {
        match self {
            Metric::Defined(_) => None,
            Metric::Undefined(r) => Some(*r),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Metric<U> {
        match self {
            Metric::Defined(v) => Metric::Defined(f(v)),
            Metric::Undefined(r) => Metric::Undefined(r),
        }
    }
}

/// Every tunable of the pipeline. Missing sections in a JSON file fall back
/// to their defaults.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Params {
    pub normalize: NormalizeParams,
    pub wind: WindParams,
    pub maneuver: ManeuverParams,
    pub tactics: TacticsParams,
    pub baseline: BaselineParams,
    pub fleet: FleetParams,
}

impl Params {
    pub fn validate(&self) -> Result<(), SailError> {
        let n = &self.normalize;
        positive("normalize.sample_interval_s", n.sample_interval_s)?;
        positive("normalize.max_gap_s", n.max_gap_s)?;
        positive("normalize.max_speed_kn", n.max_speed_kn)?;
        positive("normalize.max_accel_kn_per_s", n.max_accel_kn_per_s)?;
        if n.max_gap_s < n.sample_interval_s {
            return Err(SailError::InvalidParameter(
                "normalize.max_gap_s must be >= sample_interval_s".into(),
            ));
        }
        if n.min_valid_fixes < 2 {
            return Err(SailError::InvalidParameter(
                "normalize.min_valid_fixes must be at least 2".into(),
            ));
        }
        positive("wind.smooth_window_s", self.wind.smooth_window_s)?;
        positive("wind.shift_threshold_deg", self.wind.shift_threshold_deg)?;
        positive("wind.min_oscillation_period_s", self.wind.min_oscillation_period_s)?;
        positive("wind.min_oscillation_cycles", self.wind.min_oscillation_cycles)?;
        if self.wind.max_oscillation_period_s <= self.wind.min_oscillation_period_s {
            return Err(SailError::InvalidParameter(
                "wind.max_oscillation_period_s must exceed min_oscillation_period_s".into(),
            ));
        }
        let m = &self.maneuver;
        positive("maneuver.turn_rate_dps", m.turn_rate_dps)?;
        positive("maneuver.stable_rate_dps", m.stable_rate_dps)?;
        if m.stable_rate_dps > m.turn_rate_dps {
            return Err(SailError::InvalidParameter(
                "maneuver.stable_rate_dps must not exceed turn_rate_dps".into(),
            ));
        }
        if !(0.0..=1.0).contains(&m.recovery_fraction) {
            return Err(SailError::InvalidParameter(
                "maneuver.recovery_fraction must be within [0, 1]".into(),
            ));
        }
        positive("baseline.twa_bucket_deg", self.baseline.twa_bucket_deg)?;
        positive("baseline.anomaly_threshold", self.baseline.anomaly_threshold)?;
        Ok(())
    }

    /// SHA-256 of the canonical JSON encoding; identifies the configuration
    /// a set of derived records was computed with.
    pub fn hash_sha256(&self) -> Result<String, SailError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| SailError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

fn positive(name: &str, value: f64) -> Result<(), SailError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SailError::InvalidParameter(format!(
            "{name} must be a positive number (got {value})"
        )))
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_validate() {
        Params::default().validate().unwrap();
    }

    #[test]
    fn params_hash_is_stable_and_sensitive() {
        let a = Params::default();
        let mut b = Params::default();
        assert_eq!(a.hash_sha256().unwrap(), b.hash_sha256().unwrap());
        b.normalize.sample_interval_s = 2.0;
        assert_ne!(a.hash_sha256().unwrap(), b.hash_sha256().unwrap());
    }

    #[test]
    fn partial_params_json_uses_defaults() {
        let params: Params =
            serde_json::from_str(r#"{"maneuver": {"turn_rate_dps": 8.0}}"#).unwrap();
        assert_eq!(params.maneuver.turn_rate_dps, 8.0);
        assert_eq!(params.normalize, NormalizeParams::default());
    }

    #[test]
    fn rejects_inverted_gap_threshold() {
        let mut params = Params::default();
        params.normalize.max_gap_s = 0.5;
        assert!(matches!(
            params.validate(),
            Err(SailError::InvalidParameter(_))
        ));
    }

    #[test]
    fn rejects_zero_oscillation_cycles() {
        let mut params = Params::default();
        params.wind.min_oscillation_cycles = 0.0;
        assert!(matches!(
            params.validate(),
            Err(SailError::InvalidParameter(_))
        ));
    }

    #[test]
    fn metric_serializes_with_reason() {
        let m: Metric<f64> = Metric::Undefined(Undefined::MissingWind);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"status":"undefined","value":"missing_wind"}"#);
    }
}
