//! Streaming maneuver detection (tack, gybe, mark rounding) from heading-rate
//! and speed-loss signatures.

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::{haversine_distance, norm360, signed_delta, unwrap_degrees};
use crate::normalize::{Gap, TelemetrySeries};
use crate::tactics::CourseConfig;
use crate::wind::WindAnalysis;
use crate::GeoPoint;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManeuverParams {
    /// Heading rate (deg/s) that opens a turn once sustained.
    pub turn_rate_dps: f64,
    pub sustain_s: f64,
    /// Heading rate below which the boat counts as settled.
    pub stable_rate_dps: f64,
    pub stable_s: f64,
    /// Share of entry speed that must be regained before a turn closes.
    pub recovery_fraction: f64,
    pub min_heading_change_deg: f64,
    /// Turns still open after this long are reported as unresolved.
    pub max_turn_s: f64,
    /// Window before the turn used to measure entry speed.
    pub pre_turn_window_s: f64,
    /// Centered heading smoothing window, in samples.
    pub smooth_window: usize,
    pub min_speed_kn: f64,
    pub mark_proximity_m: f64,
}

impl Default for ManeuverParams {
    fn default() -> Self {
        Self {
            turn_rate_dps: 6.0,
            sustain_s: 2.0,
            stable_rate_dps: 3.0,
            stable_s: 2.0,
            recovery_fraction: 0.8,
            min_heading_change_deg: 55.0,
            max_turn_s: 60.0,
            pre_turn_window_s: 5.0,
            smooth_window: 3,
            min_speed_kn: 1.0,
            mark_proximity_m: 50.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnclassifiedReason {
    MissingWind,
    NoWindCrossing,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ManeuverKind {
    Tack,
    Gybe,
    Rounding { mark_distance_m: f64 },
    Unclassified { reason: UnclassifiedReason },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Maneuver {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ManeuverKind,
    pub entry_heading_deg: f64,
    pub exit_heading_deg: f64,
    /// Signed, clockwise positive.
    pub heading_change_deg: f64,
    pub duration_s: f64,
    pub entry_speed_kn: f64,
    pub min_speed_kn: f64,
    pub speed_loss_kn: f64,
    pub recovery_s: f64,
    /// 0..=100, higher is cleaner.
    pub score: f64,
}

impl Maneuver {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start_ts && ts <= self.end_ts
    }
}

/// Quality score from duration, speed loss and over-rotation.
pub fn maneuver_score(duration_s: f64, speed_loss_kn: f64, heading_change_deg: f64) -> f64 {
    let over_rotation = (heading_change_deg.abs() - 110.0).max(0.0);
    (100.0 - 1.5 * duration_s - 12.0 * speed_loss_kn.max(0.0) - 0.25 * over_rotation)
        .clamp(0.0, 100.0)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedReason {
    GapInterrupted,
    SessionEnded,
    Timeout,
}

/// A turn that opened but never closed cleanly. Not a confirmed maneuver.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnresolvedTurn {
    pub start_ts: DateTime<Utc>,
    pub last_ts: DateTime<Utc>,
    pub heading_change_deg: f64,
    pub reason: UnresolvedReason,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ManeuverReport {
    pub maneuvers: Vec<Maneuver>,
    pub unresolved: Vec<UnresolvedTurn>,
    /// Turns closed below the minimum heading change.
    pub rejected_turns: usize,
}

impl ManeuverReport {
    pub fn count(&self, pred: impl Fn(&ManeuverKind) -> bool) -> usize {
        self.maneuvers.iter().filter(|m| pred(&m.kind)).count()
    }

    pub fn tacks(&self) -> usize {
        self.count(|k| matches!(k, ManeuverKind::Tack))
    }

    pub fn gybes(&self) -> usize {
        self.count(|k| matches!(k, ManeuverKind::Gybe))
    }

    pub fn mean_score(&self) -> Option<f64> {
        if self.maneuvers.is_empty() {
            return None;
        }
        Some(self.maneuvers.iter().map(|m| m.score).sum::<f64>() / self.maneuvers.len() as f64)
    }

    /// Whether `ts` falls inside any confirmed maneuver.
    pub fn covers(&self, ts: DateTime<Utc>) -> bool {
        self.maneuvers.iter().any(|m| m.contains(ts))
    }
}

/// One input step for the detector.
#[derive(Clone, Debug)]
pub struct ManeuverFrame {
    pub timestamp: DateTime<Utc>,
    pub offset_s: f64,
    pub heading_deg: f64,
    pub sog_kn: f64,
    pub position: GeoPoint,
    pub twd_deg: Option<f64>,
}

#[derive(Clone, Debug)]
struct OpenTurn {
    start: usize,
    entry_speed: f64,
    end: Option<usize>,
}

#[derive(Clone, Debug)]
enum State {
    Cruising { over_from: Option<(usize, f64)> },
    Turning(OpenTurn),
}

/// Single-pass CRUISING/TURNING state machine. Frames must arrive in time
/// order; call [`ManeuverDetector::on_gap`] at every discontinuity.
pub struct ManeuverDetector {
    params: ManeuverParams,
    mark: Option<GeoPoint>,
    frames: Vec<ManeuverFrame>,
    state: State,
    report: ManeuverReport,
}

impl ManeuverDetector {
    pub fn new(params: ManeuverParams, mark: Option<GeoPoint>) -> Self {
        Self {
            params,
            mark,
            frames: Vec::new(),
            state: State::Cruising { over_from: None },
            report: ManeuverReport::default(),
        }
    }

    pub fn is_turning(&self) -> bool {
        matches!(self.state, State::Turning(_))
    }

    /// Feed one frame; returns the maneuver this frame completed, if any.
    pub fn push(&mut self, mut frame: ManeuverFrame) -> Option<Maneuver> {
        if let Some(prev) = self.frames.last() {
            frame.heading_deg = prev.heading_deg + signed_delta(prev.heading_deg, frame.heading_deg);
        }
        self.frames.push(frame);
        let i = self.frames.len() - 1;
        if i == 0 {
            return None;
        }
        let rate = self.rate(i);
        let state = std::mem::replace(&mut self.state, State::Cruising { over_from: None });
        let (next, emitted) = match state {
            State::Cruising { over_from } => (self.cruise(i, rate, over_from), None),
            State::Turning(turn) => self.turn(i, rate, turn),
        };
        self.state = next;
        emitted
    }

    /// Close any open turn as unresolved and forget the segment.
    pub fn on_gap(&mut self, gap: &Gap) {
        if let State::Turning(OpenTurn { start, .. }) = self.state {
            debug!(
                "maneuver: turn interrupted by {:.0}s gap at {}",
                gap.duration_s, gap.start
            );
            let last = self.frames.len() - 1;
            self.unresolve(start, last, UnresolvedReason::GapInterrupted);
        }
        self.state = State::Cruising { over_from: None };
        self.frames.clear();
    }

    pub fn finish(mut self) -> ManeuverReport {
        if let State::Turning(OpenTurn { start, .. }) = self.state {
            let last = self.frames.len() - 1;
            self.unresolve(start, last, UnresolvedReason::SessionEnded);
        }
        self.report
    }

    fn t(&self, i: usize) -> f64 {
        self.frames[i].offset_s
    }

    fn rate(&self, i: usize) -> f64 {
        let dt = self.t(i) - self.t(i - 1);
        if dt <= 0.0 {
            return 0.0;
        }
        (self.frames[i].heading_deg - self.frames[i - 1].heading_deg) / dt
    }

    fn cruise(&self, i: usize, rate: f64, over_from: Option<(usize, f64)>) -> State {
        let p = &self.params;
        if rate.abs() < p.turn_rate_dps || self.frames[i - 1].sog_kn < p.min_speed_kn {
            return State::Cruising { over_from: None };
        }
        let sign = rate.signum();
        let first = match over_from {
            Some((k, s)) if s == sign => k,
            _ => i,
        };
        let start = first - 1;
        if self.t(i) - self.t(start) < p.sustain_s {
            return State::Cruising {
                over_from: Some((first, sign)),
            };
        }
        let entry_speed = self.entry_speed(start);
        if entry_speed < p.min_speed_kn {
            return State::Cruising { over_from: None };
        }
        State::Turning(OpenTurn {
            start,
            entry_speed,
            end: None,
        })
    }

    fn turn(&mut self, i: usize, rate: f64, mut turn: OpenTurn) -> (State, Option<Maneuver>) {
        let p = &self.params;
        if self.t(i) - self.t(turn.start) > p.max_turn_s {
            self.unresolve(turn.start, i, UnresolvedReason::Timeout);
            return (State::Cruising { over_from: None }, None);
        }
        if rate.abs() >= p.stable_rate_dps {
            turn.end = None;
            return (State::Turning(turn), None);
        }
        let end = *turn.end.get_or_insert(i - 1);
        let recovered = self.frames[i].sog_kn >= p.recovery_fraction * turn.entry_speed;
        if self.t(i) - self.t(end) >= p.stable_s && recovered {
            let emitted = self.close(&turn, end, i);
            return (State::Cruising { over_from: None }, emitted);
        }
        (State::Turning(turn), None)
    }

    fn entry_speed(&self, start: usize) -> f64 {
        let from = self.t(start) - self.params.pre_turn_window_s;
        let window: Vec<f64> = self.frames[..=start]
            .iter()
            .filter(|f| f.offset_s >= from)
            .map(|f| f.sog_kn)
            .collect();
        window.iter().sum::<f64>() / window.len() as f64
    }

    fn close(&mut self, turn: &OpenTurn, end: usize, now: usize) -> Option<Maneuver> {
        let start = turn.start;
        let change = self.frames[end].heading_deg - self.frames[start].heading_deg;
        if change.abs() < self.params.min_heading_change_deg {
            debug!(
                "maneuver: rejected {:.0}° turn at {}",
                change, self.frames[start].timestamp
            );
            self.report.rejected_turns += 1;
            return None;
        }
        let min_speed = self.frames[start..=now]
            .iter()
            .map(|f| f.sog_kn)
            .fold(f64::INFINITY, f64::min);
        let duration = self.t(end) - self.t(start);
        let speed_loss = (turn.entry_speed - min_speed).max(0.0);
        let maneuver = Maneuver {
            start_ts: self.frames[start].timestamp,
            end_ts: self.frames[end].timestamp,
            kind: self.classify(start, end),
            entry_heading_deg: norm360(self.frames[start].heading_deg),
            exit_heading_deg: norm360(self.frames[end].heading_deg),
            heading_change_deg: change,
            duration_s: duration,
            entry_speed_kn: turn.entry_speed,
            min_speed_kn: min_speed,
            speed_loss_kn: speed_loss,
            recovery_s: self.t(now) - self.t(end),
            score: maneuver_score(duration, speed_loss, change),
        };
        self.report.maneuvers.push(maneuver.clone());
        Some(maneuver)
    }

    fn classify(&self, start: usize, end: usize) -> ManeuverKind {
        if let Some(mark) = self.mark {
            let closest = self.frames[start..=end]
                .iter()
                .map(|f| haversine_distance(f.position, mark))
                .fold(f64::INFINITY, f64::min);
            if closest <= self.params.mark_proximity_m {
                return ManeuverKind::Rounding {
                    mark_distance_m: closest,
                };
            }
        }
        let mid_t = (self.t(start) + self.t(end)) / 2.0;
        let mid = (start..=end)
            .min_by_key(|&k| OrderedFloat((self.t(k) - mid_t).abs()))
            .unwrap_or(start);
        let Some(twd) = self.frames[mid].twd_deg else {
            return ManeuverKind::Unclassified {
                reason: UnclassifiedReason::MissingWind,
            };
        };
        let h0 = self.frames[start].heading_deg;
        let h1 = self.frames[end].heading_deg;
        match (first_crossing(h0, h1, twd), first_crossing(h0, h1, twd + 180.0)) {
            (Some(head), Some(stern)) if head <= stern => ManeuverKind::Tack,
            (Some(_), Some(_)) => ManeuverKind::Gybe,
            (Some(_), None) => ManeuverKind::Tack,
            (None, Some(_)) => ManeuverKind::Gybe,
            (None, None) => ManeuverKind::Unclassified {
                reason: UnclassifiedReason::NoWindCrossing,
            },
        }
    }

    fn unresolve(&mut self, start: usize, last: usize, reason: UnresolvedReason) {
        self.report.unresolved.push(UnresolvedTurn {
            start_ts: self.frames[start].timestamp,
            last_ts: self.frames[last].timestamp,
            heading_change_deg: self.frames[last].heading_deg - self.frames[start].heading_deg,
            reason,
        });
    }
}

/// Rotation from `h0` (in the turn's direction) at which the bow first points
/// at `direction`, if the turn from `h0` to `h1` gets there.
fn first_crossing(h0: f64, h1: f64, direction: f64) -> Option<f64> {
    let span = h1 - h0;
    if span == 0.0 {
        return None;
    }
    let d = if span > 0.0 {
        (direction - h0).rem_euclid(360.0)
    } else {
        (h0 - direction).rem_euclid(360.0)
    };
    (d <= span.abs()).then_some(d)
}

fn centered_mean(values: &[f64], window: usize) -> Vec<f64> {
    let radius = window.max(1) / 2;
    (0..values.len())
        .map(|i| {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(values.len());
            values[lo..hi].iter().sum::<f64>() / (hi - lo) as f64
        })
        .collect()
}

/// Run the detector over every segment of a normalized series.
pub fn detect_maneuvers(
    series: &TelemetrySeries,
    wind: &WindAnalysis,
    course: &CourseConfig,
    params: &ManeuverParams,
) -> ManeuverReport {
    let samples = series.samples();
    let mut detector = ManeuverDetector::new(params.clone(), course.mark);
    for (k, range) in series.segment_ranges().into_iter().enumerate() {
        if k > 0 {
            if let Some(gap) = series.gaps().get(k - 1) {
                detector.on_gap(gap);
            }
        }
        let headings: Vec<f64> = samples[range.clone()].iter().map(|s| s.heading()).collect();
        let smoothed = centered_mean(&unwrap_degrees(&headings), params.smooth_window);
        for (j, i) in range.enumerate() {
            let s = &samples[i];
            detector.push(ManeuverFrame {
                timestamp: s.timestamp,
                offset_s: s.offset_s,
                heading_deg: smoothed[j],
                sog_kn: s.sog_kn,
                position: s.position(),
                twd_deg: wind.twd_at(i),
            });
        }
    }
    let report = detector.finish();
    debug!(
        "maneuver: {} confirmed, {} unresolved, {} rejected",
        report.maneuvers.len(),
        report.unresolved.len(),
        report.rejected_turns
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Frames with a heading/speed profile and a fixed wind.
    fn frames(profile: &[(f64, f64)], twd: Option<f64>) -> Vec<ManeuverFrame> {
        profile
            .iter()
            .enumerate()
            .map(|(i, &(heading, sog))| ManeuverFrame {
                timestamp: t0() + Duration::seconds(i as i64),
                offset_s: i as f64,
                heading_deg: heading,
                sog_kn: sog,
                position: GeoPoint::new(50.0, -1.0),
                twd_deg: twd,
            })
            .collect()
    }

    fn turn_profile(from: f64, step: f64, steps: usize) -> Vec<(f64, f64)> {
        let mut p = vec![(from, 5.0); 10];
        for k in 1..=steps {
            p.push((from + step * k as f64, 4.0));
        }
        let to = from + step * steps as f64;
        p.push((to, 4.5));
        p.extend(vec![(to, 5.0); 10]);
        p
    }

    fn run(frames: Vec<ManeuverFrame>, mark: Option<GeoPoint>) -> ManeuverReport {
        let mut det = ManeuverDetector::new(ManeuverParams::default(), mark);
        for f in frames {
            det.push(f);
        }
        det.finish()
    }

    #[test]
    fn tack_through_head_to_wind() {
        let report = run(frames(&turn_profile(315.0, 30.0, 3), Some(0.0)), None);
        assert_eq!(report.maneuvers.len(), 1);
        let m = &report.maneuvers[0];
        assert_eq!(m.kind, ManeuverKind::Tack);
        assert_eq!(m.start_ts, t0() + Duration::seconds(9));
        assert!((m.heading_change_deg - 90.0).abs() < 1e-9);
        assert!((m.entry_speed_kn - 5.0).abs() < 1e-9);
        assert!((m.speed_loss_kn - 1.0).abs() < 1e-9);
        assert!(m.score > 0.0 && m.score < 100.0);
    }

    #[test]
    fn gybe_through_dead_downwind() {
        let report = run(frames(&turn_profile(135.0, 30.0, 3), Some(0.0)), None);
        assert_eq!(report.gybes(), 1);
        assert_eq!(report.tacks(), 0);
    }

    #[test]
    fn rounding_near_mark() {
        let report = run(
            frames(&turn_profile(315.0, 30.0, 3), Some(0.0)),
            Some(GeoPoint::new(50.0001, -1.0)),
        );
        assert!(matches!(
            report.maneuvers[0].kind,
            ManeuverKind::Rounding { mark_distance_m } if mark_distance_m < 20.0
        ));
    }

    #[test]
    fn missing_wind_is_unclassified() {
        let report = run(frames(&turn_profile(315.0, 30.0, 3), None), None);
        assert_eq!(
            report.maneuvers[0].kind,
            ManeuverKind::Unclassified {
                reason: UnclassifiedReason::MissingWind
            }
        );
    }

    #[test]
    fn small_wiggle_rejected() {
        let report = run(frames(&turn_profile(0.0, 10.0, 3), Some(0.0)), None);
        assert!(report.maneuvers.is_empty());
        assert_eq!(report.rejected_turns, 1);
    }

    #[test]
    fn gap_closes_open_turn_as_unresolved() {
        let mut det = ManeuverDetector::new(ManeuverParams::default(), None);
        let fs = frames(&turn_profile(315.0, 30.0, 3), Some(0.0));
        for f in fs.iter().take(13).cloned() {
            det.push(f);
        }
        assert!(det.is_turning());
        det.on_gap(&Gap {
            after_index: 12,
            start: fs[12].timestamp,
            end: fs[12].timestamp + Duration::seconds(300),
            duration_s: 300.0,
        });
        assert!(!det.is_turning());
        let report = det.finish();
        assert!(report.maneuvers.is_empty());
        assert_eq!(report.unresolved[0].reason, UnresolvedReason::GapInterrupted);
    }

    #[test]
    fn score_formula() {
        assert_eq!(maneuver_score(0.0, 0.0, 90.0), 100.0);
        assert!((maneuver_score(4.0, 1.0, 130.0) - (100.0 - 6.0 - 12.0 - 5.0)).abs() < 1e-9);
        assert_eq!(maneuver_score(100.0, 5.0, 180.0), 0.0);
    }

    #[test]
    fn maneuver_json_is_flat() {
        let report = run(frames(&turn_profile(315.0, 30.0, 3), Some(0.0)), None);
        let json = serde_json::to_value(&report.maneuvers[0]).unwrap();
        assert_eq!(json["kind"], "tack");
    }
}
