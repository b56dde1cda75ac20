//! Telemetry normalizer: validation, ordering, de-duplication, jump rejection
//! and resampling onto a uniform grid with explicit gap markers.

use std::ops::Range;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geo::{haversine_distance, lerp_angle, mps_to_knots, norm360};
use crate::{ApparentWind, GeoPoint, SailError, TelemetryFix, WindReading};

/// Consecutive jump rejections after which the anchor's run may be the outlier.
const REANCHOR_AFTER: usize = 3;
const TIME_EPS: f64 = 1e-6;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NormalizeParams {
    /// Nominal spacing of the output grid (seconds).
    pub sample_interval_s: f64,
    /// Gaps longer than this are not interpolated; a gap marker is emitted.
    pub max_gap_s: f64,
    /// Speed above which a fix (reported or implied by position) is rejected.
    pub max_speed_kn: f64,
    /// Change of reported speed per second above which a fix is rejected.
    pub max_accel_kn_per_s: f64,
    pub min_valid_fixes: usize,
}

impl Default for NormalizeParams {
    fn default() -> Self {
        Self {
            sample_interval_s: 1.0,
            max_gap_s: 30.0,
            max_speed_kn: 40.0,
            max_accel_kn_per_s: 6.0,
            min_valid_fixes: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    Malformed { detail: String },
    DuplicateTimestamp,
    ImplausibleSpeed { speed_kn: f64 },
    ImplausibleAcceleration { accel_kn_per_s: f64 },
    /// Part of a run too short to form a segment of its own.
    IsolatedSegment { fixes: usize },
}

/// A fix dropped during cleaning. `index` is its position in arrival order.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RejectedFix {
    pub index: usize,
    pub timestamp: DateTime<Utc>,
    pub reason: RejectReason,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    /// Seconds since the first sample of the series.
    pub offset_s: f64,
    pub lat: f64,
    pub lon: f64,
    pub sog_kn: f64,
    pub cog_deg: f64,
    pub heading_deg: Option<f64>,
    pub wind: Option<WindReading>,
    pub apparent: Option<ApparentWind>,
    /// Index of the contiguous segment this sample belongs to.
    pub segment: usize,
}

impl Sample {
    /// Compass heading, falling back to course over ground.
    pub fn heading(&self) -> f64 {
        self.heading_deg.unwrap_or(self.cog_deg)
    }

    pub fn position(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }
}

/// A discontinuity in the series. No derived computation spans a gap.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Gap {
    /// Index of the last sample before the gap.
    pub after_index: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_s: f64,
}

/// Uniformly sampled, strictly time-ordered telemetry for one session.
/// Immutable once built; renormalizing produces a new series.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct TelemetrySeries {
    interval_s: f64,
    samples: Vec<Sample>,
    gaps: Vec<Gap>,
    rejected: Vec<RejectedFix>,
    input_fixes: usize,
}

impl TelemetrySeries {
    pub fn interval_s(&self) -> f64 {
        self.interval_s
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn gaps(&self) -> &[Gap] {
        &self.gaps
    }

    pub fn rejected(&self) -> &[RejectedFix] {
        &self.rejected
    }

    pub fn input_fixes(&self) -> usize {
        self.input_fixes
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.samples.first().map(|s| s.timestamp)
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.samples.last().map(|s| s.timestamp)
    }

    /// Index ranges of the contiguous segments between gap markers.
    pub fn segment_ranges(&self) -> Vec<Range<usize>> {
        let mut ranges = Vec::with_capacity(self.gaps.len() + 1);
        let mut start = 0;
        for gap in &self.gaps {
            ranges.push(start..gap.after_index + 1);
            start = gap.after_index + 1;
        }
        if start < self.samples.len() {
            ranges.push(start..self.samples.len());
        }
        ranges
    }

    pub fn segments(&self) -> impl Iterator<Item = &[Sample]> + '_ {
        self.segment_ranges()
            .into_iter()
            .map(move |r| &self.samples[r])
    }

    /// Seconds of data actually covered by samples (gaps excluded).
    pub fn covered_s(&self) -> f64 {
        self.segments()
            .map(|seg| match (seg.first(), seg.last()) {
                (Some(a), Some(b)) => b.offset_s - a.offset_s + self.interval_s,
                _ => 0.0,
            })
            .sum()
    }
}

/// Basic schema check applied at ingestion.
pub fn validate_fix(fix: &TelemetryFix) -> Result<(), SailError> {
    let bad = |detail: String| Err(SailError::MalformedInput(detail));
    if !fix.lat.is_finite() || !(-90.0..=90.0).contains(&fix.lat) {
        return bad(format!("latitude {} out of range", fix.lat));
    }
    if !fix.lon.is_finite() || !(-180.0..=180.0).contains(&fix.lon) {
        return bad(format!("longitude {} out of range", fix.lon));
    }
    if !fix.sog_kn.is_finite() || fix.sog_kn < 0.0 {
        return bad(format!("speed over ground {} is negative or not finite", fix.sog_kn));
    }
    if !fix.cog_deg.is_finite() {
        return bad("course over ground is not finite".into());
    }
    if fix.heading_deg.map_or(false, |h| !h.is_finite()) {
        return bad("heading is not finite".into());
    }
    if let Some(w) = fix.wind {
        if !w.direction_deg.is_finite() || !w.speed_kn.is_finite() || w.speed_kn < 0.0 {
            return bad("external wind reading is invalid".into());
        }
    }
    if let Some(a) = fix.apparent {
        if !a.angle_deg.is_finite() || !a.speed_kn.is_finite() || a.speed_kn < 0.0 {
            return bad("apparent wind reading is invalid".into());
        }
    }
    Ok(())
}

/// Clean and resample raw fixes (in arrival order) into a [`TelemetrySeries`].
pub fn normalize(raw: &[TelemetryFix], params: &NormalizeParams) -> Result<TelemetrySeries, SailError> {
    if !(params.sample_interval_s > 0.0) {
        return Err(SailError::InvalidParameter(
            "normalize.sample_interval_s must be positive".into(),
        ));
    }
    let mut rejected = Vec::new();

    let mut valid: Vec<(usize, TelemetryFix)> = Vec::with_capacity(raw.len());
    for (index, fix) in raw.iter().enumerate() {
        match validate_fix(fix) {
            Ok(()) => {
                let mut fix = fix.clone();
                fix.cog_deg = norm360(fix.cog_deg);
                fix.heading_deg = fix.heading_deg.map(norm360);
                if let Some(w) = fix.wind.as_mut() {
                    w.direction_deg = norm360(w.direction_deg);
                }
                valid.push((index, fix));
            }
            Err(err) => {
                debug!(index, "rejecting fix: {}", err);
                rejected.push(RejectedFix {
                    index,
                    timestamp: fix.timestamp,
                    reason: RejectReason::Malformed {
                        detail: err.to_string(),
                    },
                });
            }
        }
    }

    // Stable sort keeps arrival order among equal timestamps, so the first
    // arrival wins the de-duplication below.
    valid.sort_by_key(|(_, f)| f.timestamp);
    let mut unique: Vec<(usize, TelemetryFix)> = Vec::with_capacity(valid.len());
    for (index, fix) in valid {
        if unique.last().map_or(false, |(_, prev)| prev.timestamp == fix.timestamp) {
            rejected.push(RejectedFix {
                index,
                timestamp: fix.timestamp,
                reason: RejectReason::DuplicateTimestamp,
            });
            continue;
        }
        unique.push((index, fix));
    }

    let need = params.min_valid_fixes.max(1);
    let insufficient = |have| SailError::InsufficientData {
        stage: "normalize",
        have,
        need,
    };
    let accepted = reject_jumps(unique, params, &mut rejected);
    if accepted.len() < need {
        return Err(insufficient(accepted.len()));
    }
    let accepted = reject_isolated(accepted, params, &mut rejected);
    if accepted.len() < need {
        return Err(insufficient(accepted.len()));
    }

    rejected.sort_by_key(|r| r.index);
    if !rejected.is_empty() {
        info!(
            "normalize: {} of {} fixes rejected",
            rejected.len(),
            raw.len()
        );
    }

    let (samples, gaps) = resample(&accepted, params);
    Ok(TelemetrySeries {
        interval_s: params.sample_interval_s,
        samples,
        gaps,
        rejected,
        input_fixes: raw.len(),
    })
}

fn reject_jumps(
    fixes: Vec<(usize, TelemetryFix)>,
    params: &NormalizeParams,
    rejected: &mut Vec<RejectedFix>,
) -> Vec<(usize, TelemetryFix)> {
    let mut out: Vec<(usize, TelemetryFix)> = Vec::with_capacity(fixes.len());
    let mut streak: Vec<(usize, TelemetryFix, RejectReason)> = Vec::new();
    // Start of the run of accepted fixes the current anchor belongs to.
    let mut run_start = 0usize;
    let mut consistent = true;
    let reject = |rejected: &mut Vec<RejectedFix>, index, fix: &TelemetryFix, reason| {
        rejected.push(RejectedFix {
            index,
            timestamp: fix.timestamp,
            reason,
        })
    };

    for (index, fix) in fixes {
        if fix.sog_kn > params.max_speed_kn {
            let speed_kn = fix.sog_kn;
            reject(rejected, index, &fix, RejectReason::ImplausibleSpeed { speed_kn });
            continue;
        }
        let verdict = out
            .last()
            .and_then(|(_, anchor)| jump_verdict(anchor, &fix, params));
        let Some(reason) = verdict else {
            for (i, f, reason) in streak.drain(..) {
                reject(rejected, i, &f, reason);
            }
            consistent = true;
            out.push((index, fix));
            continue;
        };
        if let Some((_, prev, _)) = streak.last() {
            consistent &= jump_verdict(prev, &fix, params).is_none();
        }
        streak.push((index, fix, reason));

        // A self-consistent streak that outlasts the anchor's run replaces it.
        let run_len = out.len() - run_start;
        if streak.len() < REANCHOR_AFTER || !consistent || streak.len() <= run_len {
            continue;
        }
        warn!(
            "normalize: re-anchoring after {} rejections; dropping {} earlier fixes",
            streak.len(),
            run_len
        );
        let reason = streak[0].2.clone();
        for (i, f) in out.drain(run_start..) {
            reject(rejected, i, &f, reason.clone());
        }
        run_start = out.len();
        out.extend(streak.drain(..).map(|(i, f, _)| (i, f)));
    }
    for (i, f, reason) in streak {
        reject(rejected, i, &f, reason);
    }
    out
}

/// Drops runs of fixes (split at `max_gap_s`) shorter than `min_valid_fixes`,
/// such as a lone fix with a stray timestamp.
fn reject_isolated(
    fixes: Vec<(usize, TelemetryFix)>,
    params: &NormalizeParams,
    rejected: &mut Vec<RejectedFix>,
) -> Vec<TelemetryFix> {
    let mut out = Vec::with_capacity(fixes.len());
    let mut run: Vec<(usize, TelemetryFix)> = Vec::new();
    let mut flush = |run: &mut Vec<(usize, TelemetryFix)>, out: &mut Vec<TelemetryFix>| {
        if run.len() >= params.min_valid_fixes {
            out.extend(run.drain(..).map(|(_, f)| f));
            return;
        }
        let len = run.len();
        for (index, fix) in run.drain(..) {
            debug!(index, "rejecting isolated fix at {}", fix.timestamp);
            rejected.push(RejectedFix {
                index,
                timestamp: fix.timestamp,
                reason: RejectReason::IsolatedSegment { fixes: len },
            });
        }
    };
    for (index, fix) in fixes {
        let split = run.last().map_or(false, |(_, prev)| {
            (fix.timestamp - prev.timestamp).num_milliseconds() as f64 / 1000.0 > params.max_gap_s
        });
        if split {
            flush(&mut run, &mut out);
        }
        run.push((index, fix));
    }
    flush(&mut run, &mut out);
    out
}

fn jump_verdict(
    anchor: &TelemetryFix,
    fix: &TelemetryFix,
    params: &NormalizeParams,
) -> Option<RejectReason> {
    let dt = (fix.timestamp - anchor.timestamp).num_milliseconds() as f64 / 1000.0;
    if dt <= 0.0 {
        return None;
    }
    let implied = mps_to_knots(haversine_distance(anchor.position(), fix.position()) / dt);
    if implied > params.max_speed_kn {
        return Some(RejectReason::ImplausibleSpeed { speed_kn: implied });
    }
    if dt <= params.max_gap_s {
        let accel = (fix.sog_kn - anchor.sog_kn).abs() / dt;
        if accel > params.max_accel_kn_per_s {
            return Some(RejectReason::ImplausibleAcceleration {
                accel_kn_per_s: accel,
            });
        }
    }
    None
}

fn resample(fixes: &[TelemetryFix], params: &NormalizeParams) -> (Vec<Sample>, Vec<Gap>) {
    let start = fixes[0].timestamp;
    let offsets: Vec<f64> = fixes
        .iter()
        .map(|f| (f.timestamp - start).num_milliseconds() as f64 / 1000.0)
        .collect();
    let end = offsets[offsets.len() - 1];
    let interval = params.sample_interval_s;

    let mut samples: Vec<Sample> = Vec::new();
    let mut gaps = Vec::new();
    let mut pending_gap = false;
    let mut segment = 0usize;
    let mut idx = 0usize;
    let mut k: u64 = 0;

    loop {
        let t = k as f64 * interval;
        if t > end + TIME_EPS {
            break;
        }
        while idx + 1 < fixes.len() && offsets[idx + 1] <= t + TIME_EPS {
            idx += 1;
        }
        let sample = if idx + 1 == fixes.len() || (t - offsets[idx]).abs() <= TIME_EPS {
            Some(sample_from_fix(&fixes[idx], start, t, segment))
        } else if offsets[idx + 1] - offsets[idx] > params.max_gap_s {
            None
        } else {
            let a = &fixes[idx];
            let b = &fixes[idx + 1];
            let frac = (t - offsets[idx]) / (offsets[idx + 1] - offsets[idx]);
            Some(interpolate(a, b, frac, start, t, segment))
        };

        match sample {
            Some(sample) => {
                if pending_gap {
                    if let Some(last) = samples.last() {
                        let gap = Gap {
                            after_index: samples.len() - 1,
                            start: last.timestamp,
                            end: sample.timestamp,
                            duration_s: sample.offset_s - last.offset_s,
                        };
                        warn!(
                            "normalize: {:.0}s gap from {} to {}",
                            gap.duration_s, gap.start, gap.end
                        );
                        gaps.push(gap);
                    }
                    pending_gap = false;
                }
                samples.push(sample);
                k += 1;
            }
            None => {
                pending_gap = true;
                segment += 1;
                let resume = (offsets[idx + 1] / interval - TIME_EPS).ceil().max(k as f64 + 1.0);
                k = resume as u64;
            }
        }
    }

    // A trailing segment that produced no samples needs no marker.
    (renumber_segments(samples), gaps)
}

fn renumber_segments(mut samples: Vec<Sample>) -> Vec<Sample> {
    let mut current = None;
    let mut next = 0usize;
    for s in samples.iter_mut() {
        if current != Some(s.segment) {
            current = Some(s.segment);
            next += 1;
        }
        s.segment = next - 1;
    }
    samples
}

fn grid_timestamp(start: DateTime<Utc>, t: f64) -> DateTime<Utc> {
    start + Duration::milliseconds((t * 1000.0).round() as i64)
}

fn sample_from_fix(fix: &TelemetryFix, start: DateTime<Utc>, t: f64, segment: usize) -> Sample {
    Sample {
        timestamp: grid_timestamp(start, t),
        offset_s: t,
        lat: fix.lat,
        lon: fix.lon,
        sog_kn: fix.sog_kn,
        cog_deg: fix.cog_deg,
        heading_deg: fix.heading_deg,
        wind: fix.wind,
        apparent: fix.apparent,
        segment,
    }
}

fn interpolate(
    a: &TelemetryFix,
    b: &TelemetryFix,
    frac: f64,
    start: DateTime<Utc>,
    t: f64,
    segment: usize,
) -> Sample {
    let lin = |x: f64, y: f64| x + (y - x) * frac;
    let heading_deg = match (a.heading_deg, b.heading_deg) {
        (Some(x), Some(y)) => Some(lerp_angle(x, y, frac)),
        (x, y) => nearer(frac, x, y),
    };
    let wind = match (a.wind, b.wind) {
        (Some(x), Some(y)) => Some(WindReading {
            direction_deg: lerp_angle(x.direction_deg, y.direction_deg, frac),
            speed_kn: lin(x.speed_kn, y.speed_kn),
        }),
        (x, y) => nearer(frac, x, y),
    };
    let apparent = match (a.apparent, b.apparent) {
        (Some(x), Some(y)) => Some(ApparentWind {
            angle_deg: x.angle_deg + crate::geo::signed_delta(x.angle_deg, y.angle_deg) * frac,
            speed_kn: lin(x.speed_kn, y.speed_kn),
        }),
        (x, y) => nearer(frac, x, y),
    };
    Sample {
        timestamp: grid_timestamp(start, t),
        offset_s: t,
        lat: lin(a.lat, b.lat),
        lon: lin(a.lon, b.lon),
        sog_kn: lin(a.sog_kn, b.sog_kn),
        cog_deg: lerp_angle(a.cog_deg, b.cog_deg, frac),
        heading_deg,
        wind,
        apparent,
        segment,
    }
}

fn nearer<T>(frac: f64, x: T, y: T) -> T {
    if frac < 0.5 {
        x
    } else {
        y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Boat sailing due north at 5 kn, one fix per second.
    fn straight(n: usize) -> Vec<TelemetryFix> {
        let step_deg = crate::geo::knots_to_mps(5.0) / 111_320.0;
        (0..n)
            .map(|i| {
                TelemetryFix::new(
                    t0() + Duration::seconds(i as i64),
                    50.0 + step_deg * i as f64,
                    -1.0,
                    5.0,
                    0.0,
                )
            })
            .collect()
    }

    #[test]
    fn keeps_first_duplicate_and_sorts() {
        let mut raw = straight(20);
        let mut dup = raw[5].clone();
        dup.sog_kn = 5.5;
        raw.push(dup);
        raw.reverse();
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        assert_eq!(series.len(), 20);
        assert!(series
            .samples()
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));
        let dups: Vec<_> = series
            .rejected()
            .iter()
            .filter(|r| r.reason == RejectReason::DuplicateTimestamp)
            .collect();
        assert_eq!(dups.len(), 1);
        // Reversed input: the 5.5 kn copy arrived first and is the one kept.
        assert_eq!(series.samples()[5].sog_kn, 5.5);
    }

    #[test]
    fn rejects_malformed_without_failing_series() {
        let mut raw = straight(15);
        raw[3].sog_kn = -1.0;
        raw[7].lat = f64::NAN;
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        let malformed = series
            .rejected()
            .iter()
            .filter(|r| matches!(r.reason, RejectReason::Malformed { .. }))
            .count();
        assert_eq!(malformed, 2);
        assert_eq!(series.gaps().len(), 0);
        assert_eq!(series.len(), 15);
    }

    #[test]
    fn rejects_position_jump() {
        let mut raw = straight(20);
        raw[10].lat += 0.05;
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        assert!(series
            .rejected()
            .iter()
            .any(|r| r.index == 10 && matches!(r.reason, RejectReason::ImplausibleSpeed { .. })));
        // Interpolated through the hole, so the track stays smooth.
        let s = &series.samples()[10];
        assert!((s.lat - 50.0).abs() < 0.01);
    }

    #[test]
    fn short_glitch_burst_keeps_earlier_history() {
        let mut raw = straight(60);
        for fix in &mut raw[30..33] {
            fix.lat += 0.05;
        }
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        let indices: Vec<_> = series.rejected().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![30, 31, 32]);
        assert_eq!(series.len(), 60);
        assert_eq!(series.start(), Some(t0()));
    }

    #[test]
    fn bad_first_fix_is_replaced_by_consistent_track() {
        let mut raw = straight(20);
        raw[0].lat += 0.05;
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        let indices: Vec<_> = series.rejected().iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0]);
        assert_eq!(series.start(), Some(t0() + Duration::seconds(1)));
        assert_eq!(series.len(), 19);
    }

    #[test]
    fn stray_timestamp_is_rejected_as_isolated() {
        let mut raw = straight(60);
        let mut stray = raw[10].clone();
        stray.timestamp = Utc.with_ymd_and_hms(2004, 6, 1, 12, 0, 0).unwrap();
        raw.push(stray);
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        assert_eq!(series.len(), 60);
        assert!(series.gaps().is_empty());
        assert_eq!(series.start(), Some(t0()));
        assert_eq!(series.rejected().len(), 1);
        assert_eq!(series.rejected()[0].index, 60);
        assert_eq!(
            series.rejected()[0].reason,
            RejectReason::IsolatedSegment { fixes: 1 }
        );
    }

    #[test]
    fn empty_input_with_zero_minimum_is_insufficient() {
        let params = NormalizeParams {
            min_valid_fixes: 0,
            ..NormalizeParams::default()
        };
        assert!(matches!(
            normalize(&[], &params),
            Err(SailError::InsufficientData { have: 0, need: 1, .. })
        ));
    }

    #[test]
    fn rejects_acceleration_spike() {
        let mut raw = straight(20);
        raw[8].sog_kn = 25.0;
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        assert!(series.rejected().iter().any(|r| r.index == 8
            && matches!(r.reason, RejectReason::ImplausibleAcceleration { .. })));
    }

    #[test]
    fn long_dropout_becomes_gap_marker() {
        let mut raw = straight(20);
        let later: Vec<_> = straight(20)
            .into_iter()
            .map(|mut f| {
                f.timestamp = f.timestamp + Duration::seconds(300);
                f
            })
            .collect();
        raw.extend(later);
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        assert_eq!(series.gaps().len(), 1);
        let gap = &series.gaps()[0];
        assert_eq!(gap.after_index, 19);
        assert!((gap.duration_s - 281.0).abs() < 1e-6);
        let ranges = series.segment_ranges();
        assert_eq!(ranges, vec![0..20, 20..40]);
        assert!(series.samples()[19].segment == 0 && series.samples()[20].segment == 1);
    }

    #[test]
    fn interpolates_heading_across_north() {
        let mut a = TelemetryFix::new(t0(), 50.0, -1.0, 5.0, 350.0);
        a.heading_deg = Some(350.0);
        let mut b = a.clone();
        b.timestamp = t0() + Duration::seconds(2);
        b.cog_deg = 10.0;
        b.heading_deg = Some(10.0);
        let params = NormalizeParams {
            min_valid_fixes: 2,
            ..NormalizeParams::default()
        };
        let series = normalize(&[a, b], &params).unwrap();
        assert_eq!(series.len(), 3);
        let mid = &series.samples()[1];
        assert!(mid.heading().abs() < 1e-9 || (360.0 - mid.heading()).abs() < 1e-9);
    }

    #[test]
    fn one_sided_wind_takes_the_nearer_fix() {
        let mut a = TelemetryFix::new(t0(), 50.0, -1.0, 5.0, 0.0);
        a.wind = Some(WindReading {
            direction_deg: 200.0,
            speed_kn: 10.0,
        });
        let mut b = TelemetryFix::new(t0() + Duration::seconds(4), 50.0001, -1.0, 5.0, 0.0);
        b.apparent = Some(ApparentWind {
            angle_deg: 30.0,
            speed_kn: 12.0,
        });
        let params = NormalizeParams {
            min_valid_fixes: 2,
            ..NormalizeParams::default()
        };
        let series = normalize(&[a, b], &params).unwrap();
        assert_eq!(series.len(), 5);
        let early = &series.samples()[1];
        assert_eq!(early.wind.map(|w| w.direction_deg), Some(200.0));
        assert!(early.apparent.is_none());
        let late = &series.samples()[3];
        assert!(late.wind.is_none());
        assert_eq!(late.apparent.map(|w| w.angle_deg), Some(30.0));
    }

    #[test]
    fn too_few_fixes_is_insufficient_data() {
        let raw = straight(5);
        let err = normalize(&raw, &NormalizeParams::default()).unwrap_err();
        assert!(matches!(
            err,
            SailError::InsufficientData {
                stage: "normalize",
                have: 5,
                need: 10
            }
        ));
    }
}
