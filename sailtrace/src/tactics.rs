//! Stateless per-instant tactical computations: VMG against a performance
//! curve, laylines, start-line bias and time-to-line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::{
    bearing_unit, haversine_distance, initial_bearing, knots_to_mps, mps_to_knots, norm180,
    norm360, LocalFrame,
};
use crate::normalize::{Sample, TelemetrySeries};
use crate::polar::{BoatClassProfile, Leg, PerformanceCurve, VmgTarget};
use crate::wind::{WindAnalysis, WindEstimate};
use crate::{GeoPoint, Metric, Undefined};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TacticsParams {
    /// Absolute TWA below which a leg counts as upwind.
    pub upwind_max_twa_deg: f64,
    /// Absolute TWA above which a leg counts as downwind.
    pub downwind_min_twa_deg: f64,
    /// Layline angles used when neither a polar nor a class profile applies.
    pub default_upwind_twa_deg: f64,
    pub default_downwind_twa_deg: f64,
    /// Time-to-line is only reported inside this window before the gun.
    pub countdown_s: f64,
    /// Bias magnitude below which a line is reported as square.
    pub square_line_tolerance_deg: f64,
    pub min_moving_speed_kn: f64,
}

impl Default for TacticsParams {
    fn default() -> Self {
        Self {
            upwind_max_twa_deg: 70.0,
            downwind_min_twa_deg: 110.0,
            default_upwind_twa_deg: 45.0,
            default_downwind_twa_deg: 150.0,
            countdown_s: 300.0,
            square_line_tolerance_deg: 1.0,
            min_moving_speed_kn: 0.2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct StartLine {
    /// Boat end.
    pub committee: GeoPoint,
    pub pin: GeoPoint,
}

/// Course configuration for one session. Every field is optional; metrics that
/// need a missing piece come back undefined.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CourseConfig {
    pub mark: Option<GeoPoint>,
    pub start_line: Option<StartLine>,
    pub gun_time: Option<DateTime<Utc>>,
    pub boat_class: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Tack {
    Port,
    Starboard,
}

impl Tack {
    pub fn from_twa(twa_deg: f64) -> Self {
        if twa_deg >= 0.0 {
            Tack::Starboard
        } else {
            Tack::Port
        }
    }
}

/// Everything the tactical functions need to know about one instant.
#[derive(Clone, Copy)]
pub struct TacticalContext<'a> {
    pub timestamp: DateTime<Utc>,
    pub position: GeoPoint,
    pub heading_deg: f64,
    pub sog_kn: f64,
    pub cog_deg: f64,
    pub wind: Option<WindEstimate>,
    pub course: &'a CourseConfig,
    pub curve: Option<&'a dyn PerformanceCurve>,
    pub profile: Option<&'a BoatClassProfile>,
}

impl<'a> TacticalContext<'a> {
    pub fn from_sample(
        sample: &Sample,
        wind: Option<WindEstimate>,
        course: &'a CourseConfig,
        curve: Option<&'a dyn PerformanceCurve>,
        profile: Option<&'a BoatClassProfile>,
    ) -> Self {
        Self {
            timestamp: sample.timestamp,
            position: sample.position(),
            heading_deg: sample.heading(),
            sog_kn: sample.sog_kn,
            cog_deg: sample.cog_deg,
            wind,
            course,
            curve,
            profile,
        }
    }

    fn twd(&self) -> Option<f64> {
        self.wind.map(|w| w.smoothed_twd_deg)
    }

    /// True wind angle relative to the bow; positive on starboard tack.
    pub fn twa(&self) -> Option<f64> {
        self.twd().map(|twd| norm180(twd - self.heading_deg))
    }

    /// Leg type from the bearing to the mark when one is configured,
    /// otherwise from the current TWA.
    pub fn leg(&self, params: &TacticsParams) -> Option<Leg> {
        let twd = self.twd()?;
        let angle = match self.course.mark {
            Some(mark) => norm180(twd - initial_bearing(self.position, mark)).abs(),
            None => self.twa()?.abs(),
        };
        Some(Leg::from_twa(
            angle,
            params.upwind_max_twa_deg,
            params.downwind_min_twa_deg,
        ))
    }

    /// Optimal TWA for laylines: polar first, then class profile, then the
    /// configured default.
    pub fn optimal_twa(&self, leg: Leg, params: &TacticsParams) -> Option<f64> {
        let tws = self.wind.and_then(|w| w.tws_kn);
        if let (Some(curve), Some(tws)) = (self.curve, tws) {
            if let Some(target) = curve.optimal_vmg(tws, leg) {
                return Some(target.twa_deg);
            }
        }
        if let Some(profile) = self.profile {
            // Without a wind speed the medium band is the best guess.
            if let Some(twa) = profile.optimal_twa(tws.unwrap_or(9.0), leg) {
                return Some(twa);
            }
        }
        match leg {
            Leg::Upwind => Some(params.default_upwind_twa_deg),
            Leg::Downwind => Some(params.default_downwind_twa_deg),
            Leg::Reaching => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VmgReading {
    pub twa_deg: f64,
    pub leg: Leg,
    /// Velocity component along the wind axis; positive toward the wind.
    pub instantaneous_kn: f64,
    pub target: Option<VmgTarget>,
    pub performance_pct: Option<f64>,
}

pub fn vmg(ctx: &TacticalContext<'_>, params: &TacticsParams) -> Metric<VmgReading> {
    let (Some(twa), Some(leg)) = (ctx.twa(), ctx.leg(params)) else {
        return Metric::Undefined(Undefined::MissingWind);
    };
    let instantaneous = ctx.sog_kn * twa.to_radians().cos();
    let target = match (ctx.curve, ctx.wind.and_then(|w| w.tws_kn)) {
        (Some(curve), Some(tws)) => curve.optimal_vmg(tws, leg),
        _ => None,
    };
    let performance_pct = target
        .filter(|t| t.vmg_kn > 0.0)
        .map(|t| instantaneous.abs() / t.vmg_kn * 100.0);
    Metric::Defined(VmgReading {
        twa_deg: twa,
        leg,
        instantaneous_kn: instantaneous,
        target,
        performance_pct,
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LaylineCall {
    Hold,
    TackToPort,
    TackToStarboard,
    GybeToPort,
    GybeToStarboard,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Layline {
    /// Bearing of the layline leaving the mark toward the approaching boat.
    pub bearing_deg: f64,
    /// Distance to sail on the opposite tack before reaching this layline;
    /// negative when already overstood.
    pub distance_m: f64,
    pub time_s: Option<f64>,
    pub overstood: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LaylineEstimate {
    pub leg: Leg,
    pub optimal_twa_deg: f64,
    pub port: Layline,
    pub starboard: Layline,
    pub tack: Tack,
    pub recommendation: LaylineCall,
}

/// Decompose `mark - boat` into legs along the starboard and port headings.
/// Returns `(starboard_leg_m, port_leg_m)`.
fn layline_legs(d: (f64, f64), twd: f64, optimal_twa: f64) -> Option<(f64, f64)> {
    let us = bearing_unit(twd - optimal_twa);
    let up = bearing_unit(twd + optimal_twa);
    let det = us.0 * up.1 - us.1 * up.0;
    if det.abs() < 1e-9 {
        return None;
    }
    let x = (d.0 * up.1 - d.1 * up.0) / det;
    let y = (us.0 * d.1 - us.1 * d.0) / det;
    Some((x, y))
}

pub fn layline(ctx: &TacticalContext<'_>, params: &TacticsParams) -> Metric<LaylineEstimate> {
    let Some(mark) = ctx.course.mark else {
        return Metric::Undefined(Undefined::NoMark);
    };
    let (Some(twd), Some(twa), Some(leg)) = (ctx.twd(), ctx.twa(), ctx.leg(params)) else {
        return Metric::Undefined(Undefined::MissingWind);
    };
    let Some(alpha) = ctx.optimal_twa(leg, params) else {
        return Metric::Undefined(Undefined::ReachingLeg);
    };
    let d = LocalFrame::new(ctx.position).to_local(mark);
    let Some((to_port, to_starboard)) = layline_legs(d, twd, alpha) else {
        return Metric::Undefined(Undefined::ReachingLeg);
    };

    let speed_mps = knots_to_mps(ctx.sog_kn);
    let eta = |distance: f64| {
        (ctx.sog_kn >= params.min_moving_speed_kn && distance >= 0.0)
            .then(|| distance / speed_mps)
    };
    let port = Layline {
        bearing_deg: norm360(twd + alpha + 180.0),
        distance_m: to_port,
        time_s: eta(to_port),
        overstood: to_port < 0.0,
    };
    let starboard = Layline {
        bearing_deg: norm360(twd - alpha + 180.0),
        distance_m: to_starboard,
        time_s: eta(to_starboard),
        overstood: to_starboard < 0.0,
    };

    let tack = Tack::from_twa(twa);
    let downwind = leg == Leg::Downwind;
    let recommendation = match tack {
        Tack::Starboard if to_port <= 0.0 => {
            if downwind {
                LaylineCall::GybeToPort
            } else {
                LaylineCall::TackToPort
            }
        }
        Tack::Port if to_starboard <= 0.0 => {
            if downwind {
                LaylineCall::GybeToStarboard
            } else {
                LaylineCall::TackToStarboard
            }
        }
        _ => LaylineCall::Hold,
    };

    Metric::Defined(LaylineEstimate {
        leg,
        optimal_twa_deg: alpha,
        port,
        starboard,
        tack,
        recommendation,
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FavoredEnd {
    Pin,
    Committee,
    Square,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StartBias {
    /// Positive when the pin end is favoured.
    pub bias_deg: f64,
    pub favored_end: FavoredEnd,
    /// Distance gained by starting at the favoured end.
    pub advantage_m: f64,
    pub line_length_m: f64,
}

pub fn start_line_bias(
    line: Option<&StartLine>,
    twd: Option<f64>,
    params: &TacticsParams,
) -> Metric<StartBias> {
    let Some(line) = line else {
        return Metric::Undefined(Undefined::NoStartLine);
    };
    let Some(twd) = twd else {
        return Metric::Undefined(Undefined::MissingWind);
    };
    let bearing = initial_bearing(line.committee, line.pin);
    let bias = norm180(bearing - (twd - 90.0));
    let length = haversine_distance(line.committee, line.pin);
    let favored_end = if bias.abs() < params.square_line_tolerance_deg {
        FavoredEnd::Square
    } else if bias > 0.0 {
        FavoredEnd::Pin
    } else {
        FavoredEnd::Committee
    };
    Metric::Defined(StartBias {
        bias_deg: bias,
        favored_end,
        advantage_m: length * bias.to_radians().sin().abs(),
        line_length_m: length,
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimeToLine {
    pub distance_m: f64,
    pub closing_speed_kn: f64,
    pub seconds: f64,
    /// Spare time before the gun; negative means late.
    pub time_to_burn_s: f64,
}

/// Perpendicular distance to the (infinite) start line divided by the closing
/// component of velocity.
pub fn time_to_line(ctx: &TacticalContext<'_>, params: &TacticsParams) -> Metric<TimeToLine> {
    let Some(line) = ctx.course.start_line.as_ref() else {
        return Metric::Undefined(Undefined::NoStartLine);
    };
    let Some(gun) = ctx.course.gun_time else {
        return Metric::Undefined(Undefined::CountdownNotStarted);
    };
    let to_gun = (gun - ctx.timestamp).num_milliseconds() as f64 / 1000.0;
    if to_gun > params.countdown_s {
        return Metric::Undefined(Undefined::CountdownNotStarted);
    }
    if ctx.sog_kn < params.min_moving_speed_kn {
        return Metric::Undefined(Undefined::Stationary);
    }

    let frame = LocalFrame::new(line.committee);
    let (lx, ly) = frame.to_local(line.pin);
    let len = (lx * lx + ly * ly).sqrt();
    if len < 1e-6 {
        return Metric::Undefined(Undefined::NoStartLine);
    }
    let normal = (-ly / len, lx / len);
    let (bx, by) = frame.to_local(ctx.position);
    let offset = normal.0 * bx + normal.1 * by;

    let (ux, uy) = bearing_unit(ctx.cog_deg);
    let speed = knots_to_mps(ctx.sog_kn);
    let along_normal = speed * (normal.0 * ux + normal.1 * uy);
    let closing = -offset.signum() * along_normal;
    if closing <= 0.0 {
        return Metric::Undefined(Undefined::NotClosing);
    }
    let seconds = offset.abs() / closing;
    Metric::Defined(TimeToLine {
        distance_m: offset.abs(),
        closing_speed_kn: mps_to_knots(closing),
        seconds,
        time_to_burn_s: to_gun - seconds,
    })
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TacticalSnapshot {
    pub timestamp: DateTime<Utc>,
    pub segment: usize,
    pub vmg: Metric<VmgReading>,
    pub layline: Metric<LaylineEstimate>,
    pub start_bias: Metric<StartBias>,
    pub time_to_line: Metric<TimeToLine>,
}

pub fn snapshot(ctx: &TacticalContext<'_>, segment: usize, params: &TacticsParams) -> TacticalSnapshot {
    TacticalSnapshot {
        timestamp: ctx.timestamp,
        segment,
        vmg: vmg(ctx, params),
        layline: layline(ctx, params),
        start_bias: start_line_bias(ctx.course.start_line.as_ref(), ctx.twd(), params),
        time_to_line: time_to_line(ctx, params),
    }
}

/// One snapshot per normalized sample.
pub fn snapshots(
    series: &TelemetrySeries,
    wind: &WindAnalysis,
    course: &CourseConfig,
    curve: Option<&dyn PerformanceCurve>,
    params: &TacticsParams,
) -> Vec<TacticalSnapshot> {
    let profile = course
        .boat_class
        .as_deref()
        .and_then(BoatClassProfile::builtin);
    series
        .samples()
        .iter()
        .enumerate()
        .map(|(i, sample)| {
            let ctx =
                TacticalContext::from_sample(sample, wind.at(i).copied(), course, curve, profile.as_ref());
            snapshot(&ctx, sample.segment, params)
        })
        .collect()
}
