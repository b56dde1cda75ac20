//! Fleet comparison across sessions sharing a course or time window, and
//! head-to-head (ghost) comparison between two sessions.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geo::{haversine_distance, norm180};
use crate::maneuver::ManeuverReport;
use crate::normalize::{Sample, TelemetrySeries};
use crate::wind::WindAnalysis;
use crate::{GeoPoint, SailError};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FleetMetric {
    AvgVmg,
    AvgSog,
    ManeuverCount,
    ManeuverScore,
    TimeToMark,
    Distance,
}

impl FleetMetric {
    pub const ALL: [FleetMetric; 6] = [
        FleetMetric::AvgVmg,
        FleetMetric::AvgSog,
        FleetMetric::ManeuverCount,
        FleetMetric::ManeuverScore,
        FleetMetric::TimeToMark,
        FleetMetric::Distance,
    ];

    fn higher_is_better(self) -> bool {
        !matches!(self, FleetMetric::ManeuverCount | FleetMetric::TimeToMark)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FleetParams {
    pub metrics: Vec<FleetMetric>,
    /// A boat within this distance of the mark has reached it.
    pub mark_reached_m: f64,
    /// Coverage below this fraction marks a sailor's numbers as partial.
    pub full_coverage_fraction: f64,
    /// Head-to-head results closer than this are ties.
    pub tie_band_s: f64,
}

impl Default for FleetParams {
    fn default() -> Self {
        Self {
            metrics: FleetMetric::ALL.to_vec(),
            mark_reached_m: 30.0,
            full_coverage_fraction: 0.95,
            tie_band_s: 2.0,
        }
    }
}

/// One sailor's analyzed session as seen by the fleet engine.
#[derive(Clone, Copy)]
pub struct FleetEntry<'a> {
    pub sailor_id: &'a str,
    pub session_id: &'a str,
    pub series: &'a TelemetrySeries,
    pub wind: &'a WindAnalysis,
    pub maneuvers: &'a ManeuverReport,
    pub mark: Option<GeoPoint>,
}

/// How sessions are put on a common timeline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "alignment", rename_all = "snake_case")]
pub enum FleetWindow {
    /// Shared absolute window.
    Clock {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// Each session measured from its own first sample.
    Elapsed { duration_s: f64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Coverage {
    pub window_s: f64,
    pub covered_s: f64,
    pub fraction: f64,
    pub first_ts: Option<DateTime<Utc>>,
    pub last_ts: Option<DateTime<Utc>>,
    /// Normalizer gaps overlapping the window.
    pub gaps: usize,
    pub partial: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SailorMetrics {
    pub avg_vmg_kn: Option<f64>,
    pub avg_sog_kn: Option<f64>,
    pub maneuver_count: usize,
    pub maneuver_score: Option<f64>,
    pub time_to_mark_s: Option<f64>,
    pub distance_m: f64,
}

impl SailorMetrics {
    pub fn value(&self, metric: FleetMetric) -> Option<f64> {
        match metric {
            FleetMetric::AvgVmg => self.avg_vmg_kn,
            FleetMetric::AvgSog => self.avg_sog_kn,
            FleetMetric::ManeuverCount => Some(self.maneuver_count as f64),
            FleetMetric::ManeuverScore => self.maneuver_score,
            FleetMetric::TimeToMark => self.time_to_mark_s,
            FleetMetric::Distance => Some(self.distance_m),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SailorSummary {
    pub sailor_id: String,
    pub session_id: String,
    pub coverage: Coverage,
    pub metrics: SailorMetrics,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RankedValue {
    pub sailor_id: String,
    /// Competition ranking (1, 1, 3); `None` when the metric is undefined.
    pub rank: Option<usize>,
    pub value: Option<f64>,
    pub partial: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MetricRanking {
    pub metric: FleetMetric,
    pub ranking: Vec<RankedValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FleetComparisonResult {
    pub window: FleetWindow,
    pub sailors: Vec<SailorSummary>,
    pub rankings: Vec<MetricRanking>,
}

/// Window bounds for one entry, in absolute time.
fn entry_bounds(entry: &FleetEntry<'_>, window: &FleetWindow) -> Option<(DateTime<Utc>, DateTime<Utc>, f64)> {
    match window {
        FleetWindow::Clock { start, end } => {
            Some((*start, *end, (*end - *start).num_milliseconds() as f64 / 1000.0))
        }
        FleetWindow::Elapsed { duration_s } => {
            let start = entry.series.start()?;
            let end = start + chrono::Duration::milliseconds((duration_s * 1000.0).round() as i64);
            Some((start, end, *duration_s))
        }
    }
}

fn default_window(entries: &[FleetEntry<'_>]) -> Option<FleetWindow> {
    let start = entries.iter().filter_map(|e| e.series.start()).min()?;
    let end = entries.iter().filter_map(|e| e.series.end()).max()?;
    Some(FleetWindow::Clock { start, end })
}

fn summarize(entry: &FleetEntry<'_>, window: &FleetWindow, params: &FleetParams) -> SailorSummary {
    let samples = entry.series.samples();
    let interval = entry.series.interval_s();
    let bounds = entry_bounds(entry, window);
    let window_s = bounds.map_or(0.0, |b| b.2);
    let inside: Vec<(usize, &Sample)> = match bounds {
        Some((start, end, _)) => samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.timestamp >= start && s.timestamp <= end)
            .collect(),
        None => Vec::new(),
    };

    let mut covered_s = 0.0;
    let mut distance_m = 0.0;
    for pair in inside.windows(2) {
        let (a, b) = (pair[0].1, pair[1].1);
        if a.segment == b.segment {
            covered_s += b.offset_s - a.offset_s;
            distance_m += haversine_distance(a.position(), b.position());
        }
    }
    if !inside.is_empty() {
        covered_s += interval.min(window_s);
    }
    let covered_s = covered_s.min(window_s);
    let fraction = if window_s > 0.0 { covered_s / window_s } else { 0.0 };
    let gaps = match bounds {
        Some((start, end, _)) => entry
            .series
            .gaps()
            .iter()
            .filter(|g| g.end > start && g.start < end)
            .count(),
        None => 0,
    };

    let avg_sog_kn = mean(inside.iter().map(|(_, s)| s.sog_kn));
    let avg_vmg_kn = mean(inside.iter().filter_map(|(i, s)| {
        let twd = entry.wind.twd_at(*i)?;
        Some((s.sog_kn * norm180(twd - s.heading()).to_radians().cos()).abs())
    }));

    let in_window = |ts: DateTime<Utc>| bounds.map_or(false, |(start, end, _)| ts >= start && ts <= end);
    let maneuvers: Vec<_> = entry
        .maneuvers
        .maneuvers
        .iter()
        .filter(|m| in_window(m.start_ts))
        .collect();
    let maneuver_score = mean(maneuvers.iter().map(|m| m.score));

    let time_to_mark_s = match (entry.mark, bounds) {
        (Some(mark), Some((start, _, _))) => inside
            .iter()
            .find(|(_, s)| haversine_distance(s.position(), mark) <= params.mark_reached_m)
            .map(|(_, s)| (s.timestamp - start).num_milliseconds() as f64 / 1000.0),
        _ => None,
    };

    SailorSummary {
        sailor_id: entry.sailor_id.to_string(),
        session_id: entry.session_id.to_string(),
        coverage: Coverage {
            window_s,
            covered_s,
            fraction,
            first_ts: inside.first().map(|(_, s)| s.timestamp),
            last_ts: inside.last().map(|(_, s)| s.timestamp),
            gaps,
            partial: fraction < params.full_coverage_fraction,
        },
        metrics: SailorMetrics {
            avg_vmg_kn,
            avg_sog_kn,
            maneuver_count: maneuvers.len(),
            maneuver_score,
            time_to_mark_s,
            distance_m,
        },
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

fn rank(metric: FleetMetric, sailors: &[SailorSummary]) -> MetricRanking {
    let mut rows: Vec<RankedValue> = sailors
        .iter()
        .map(|s| RankedValue {
            sailor_id: s.sailor_id.clone(),
            rank: None,
            value: s.metrics.value(metric),
            partial: s.coverage.partial,
        })
        .collect();
    let better = |a: f64, b: f64| {
        let ord = OrderedFloat(a).cmp(&OrderedFloat(b));
        if metric.higher_is_better() {
            ord.reverse()
        } else {
            ord
        }
    };
    rows.sort_by(|a, b| match (a.value, b.value) {
        (Some(x), Some(y)) => better(x, y).then_with(|| a.sailor_id.cmp(&b.sailor_id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.sailor_id.cmp(&b.sailor_id),
    });
    let mut previous: Option<(f64, usize)> = None;
    for (pos, row) in rows.iter_mut().enumerate() {
        let Some(v) = row.value else { continue };
        let r = match previous {
            Some((pv, pr)) if OrderedFloat(pv) == OrderedFloat(v) => pr,
            _ => pos + 1,
        };
        row.rank = Some(r);
        previous = Some((v, r));
    }
    MetricRanking { metric, ranking: rows }
}

/// Rank sailors over a shared window. Without an explicit window the union of
/// all sessions' clock time is used. Coverage is reported per sailor; nothing
/// is truncated to the shortest session.
pub fn compare_fleet(
    entries: &[FleetEntry<'_>],
    window: Option<FleetWindow>,
    params: &FleetParams,
) -> Result<FleetComparisonResult, SailError> {
    let window = match window.or_else(|| default_window(entries)) {
        Some(w) => w,
        None => {
            return Err(SailError::InsufficientData {
                stage: "fleet comparison",
                have: 0,
                need: 1,
            })
        }
    };
    let mut sailors: Vec<SailorSummary> = entries
        .par_iter()
        .map(|e| summarize(e, &window, params))
        .collect();
    sailors.sort_by(|a, b| a.sailor_id.cmp(&b.sailor_id).then_with(|| a.session_id.cmp(&b.session_id)));
    let rankings = params.metrics.iter().map(|&m| rank(m, &sailors)).collect();
    debug!("fleet: compared {} sessions", sailors.len());
    Ok(FleetComparisonResult {
        window,
        sailors,
        rankings,
    })
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeadToHeadResult {
    Won,
    Lost,
    Tied,
}

/// Ghost difficulty from its average speed over ground.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn from_avg_sog(avg_sog_kn: f64) -> Self {
        if avg_sog_kn < 5.0 {
            Difficulty::Easy
        } else if avg_sog_kn < 8.0 {
            Difficulty::Medium
        } else {
            Difficulty::Hard
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HeadToHead {
    pub ghost_session: String,
    pub attempt_session: String,
    pub ghost_elapsed_s: f64,
    pub attempt_elapsed_s: f64,
    /// `attempt - ghost`; negative means the attempt was faster.
    pub diff_s: f64,
    /// Largest time the attempt was ahead of the ghost at equal distance sailed.
    pub max_lead_s: f64,
    /// Largest time the attempt was behind the ghost at equal distance sailed.
    pub max_deficit_s: f64,
    pub difficulty: Difficulty,
    pub result: HeadToHeadResult,
}

/// Samples that count towards elapsed time: up to the mark when one is set
/// and reached, else the whole session.
fn course_run<'a>(entry: &FleetEntry<'a>, params: &FleetParams) -> Result<&'a [Sample], SailError> {
    let samples = entry.series.samples();
    if samples.is_empty() {
        return Err(SailError::InsufficientData {
            stage: "head-to-head",
            have: 0,
            need: 1,
        });
    }
    let end = entry
        .mark
        .and_then(|mark| {
            samples
                .iter()
                .position(|s| haversine_distance(s.position(), mark) <= params.mark_reached_m)
        })
        .unwrap_or(samples.len() - 1);
    Ok(&samples[..=end])
}

/// (elapsed seconds, distance sailed in metres) at every sample; gaps add no distance.
fn progress(run: &[Sample]) -> Vec<(f64, f64)> {
    let start = run.first().map_or(0.0, |s| s.offset_s);
    let mut distance = 0.0;
    let mut prev: Option<&Sample> = None;
    run.iter()
        .map(|s| {
            if let Some(p) = prev.filter(|p| p.segment == s.segment) {
                distance += haversine_distance(p.position(), s.position());
            }
            prev = Some(s);
            (s.offset_s - start, distance)
        })
        .collect()
}

/// Elapsed time at which `track` first covered `distance`, interpolated.
fn time_at(track: &[(f64, f64)], distance: f64) -> Option<f64> {
    let k = track.partition_point(|&(_, d)| d < distance);
    let &(t1, d1) = track.get(k)?;
    if k == 0 || d1 <= distance {
        return Some(t1);
    }
    let (t0, d0) = track[k - 1];
    Some(t0 + (t1 - t0) * (distance - d0) / (d1 - d0))
}

/// Compare an attempt against a ghost session on elapsed time.
pub fn head_to_head(
    ghost: &FleetEntry<'_>,
    attempt: &FleetEntry<'_>,
    params: &FleetParams,
) -> Result<HeadToHead, SailError> {
    let ghost_run = course_run(ghost, params)?;
    let attempt_run = course_run(attempt, params)?;
    let ghost_track = progress(ghost_run);
    let attempt_track = progress(attempt_run);

    let ghost_elapsed_s = ghost_track.last().map_or(0.0, |p| p.0);
    let attempt_elapsed_s = attempt_track.last().map_or(0.0, |p| p.0);
    let diff_s = attempt_elapsed_s - ghost_elapsed_s;
    let result = if diff_s.abs() <= params.tie_band_s {
        HeadToHeadResult::Tied
    } else if diff_s < 0.0 {
        HeadToHeadResult::Won
    } else {
        HeadToHeadResult::Lost
    };

    let (mut max_lead_s, mut max_deficit_s) = (0.0f64, 0.0f64);
    for &(t, d) in &attempt_track {
        // Past the ghost's finish there is nothing left to compare against.
        let Some(ghost_t) = time_at(&ghost_track, d) else { break };
        max_lead_s = max_lead_s.max(ghost_t - t);
        max_deficit_s = max_deficit_s.max(t - ghost_t);
    }

    let avg_sog = ghost_run.iter().map(|s| s.sog_kn).sum::<f64>() / ghost_run.len() as f64;
    Ok(HeadToHead {
        ghost_session: ghost.session_id.to_string(),
        attempt_session: attempt.session_id.to_string(),
        ghost_elapsed_s,
        attempt_elapsed_s,
        diff_s,
        max_lead_s,
        max_deficit_s,
        difficulty: Difficulty::from_avg_sog(avg_sog),
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize, NormalizeParams};
    use crate::wind::{analyze_wind, WindParams};
    use crate::{TelemetryFix, WindReading};
    use chrono::{Duration, TimeZone};

    struct Fixture {
        series: TelemetrySeries,
        wind: WindAnalysis,
        maneuvers: ManeuverReport,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// Sailing north at `sog` for `secs` seconds, starting `delay` seconds
    /// after t0, optionally with wind from the north.
    fn fixture(sog: f64, delay: i64, secs: i64, wind: bool) -> Fixture {
        let step = sog * 0.514444 / 111_320.0;
        let raw: Vec<TelemetryFix> = (0..=secs)
            .map(|i| {
                let mut f = TelemetryFix::new(
                    t0() + Duration::seconds(delay + i),
                    50.0 + i as f64 * step,
                    -1.0,
                    sog,
                    0.0,
                );
                if wind {
                    f.wind = Some(WindReading {
                        direction_deg: 0.0,
                        speed_kn: 10.0,
                    });
                }
                f
            })
            .collect();
        let series = normalize(&raw, &NormalizeParams::default()).unwrap();
        let wind = analyze_wind(&series, &WindParams::default());
        Fixture {
            series,
            wind,
            maneuvers: ManeuverReport::default(),
        }
    }

    fn entry<'a>(sailor: &'a str, f: &'a Fixture) -> FleetEntry<'a> {
        FleetEntry {
            sailor_id: sailor,
            session_id: sailor,
            series: &f.series,
            wind: &f.wind,
            maneuvers: &f.maneuvers,
            mark: None,
        }
    }

    #[test]
    fn unequal_coverage_is_reported_not_truncated() {
        let full = fixture(5.0, 0, 600, true);
        let half = fixture(6.0, 300, 300, true);
        let result = compare_fleet(
            &[entry("bo", &full), entry("al", &half)],
            None,
            &FleetParams::default(),
        )
        .unwrap();
        let al = &result.sailors[0];
        let bo = &result.sailors[1];
        assert_eq!(al.sailor_id, "al");
        assert!((bo.coverage.fraction - 1.0).abs() < 1e-9);
        assert!((al.coverage.fraction - 0.5).abs() < 0.01);
        assert!(al.coverage.partial);
        assert!(!bo.coverage.partial);

        let sog = result
            .rankings
            .iter()
            .find(|r| r.metric == FleetMetric::AvgSog)
            .unwrap();
        assert_eq!(sog.ranking[0].sailor_id, "al");
        assert_eq!(sog.ranking[0].rank, Some(1));
        assert!(sog.ranking[0].partial);
    }

    #[test]
    fn undefined_metric_ranks_last() {
        let with_wind = fixture(4.0, 0, 120, true);
        let without = fixture(5.0, 0, 120, false);
        let params = FleetParams {
            metrics: vec![FleetMetric::AvgVmg],
            ..FleetParams::default()
        };
        let result = compare_fleet(&[entry("a", &without), entry("b", &with_wind)], None, &params).unwrap();
        let ranking = &result.rankings[0].ranking;
        assert_eq!(ranking[0].sailor_id, "b");
        assert!((ranking[0].value.unwrap() - 4.0).abs() < 1e-6);
        assert_eq!(ranking[1].sailor_id, "a");
        assert_eq!(ranking[1].rank, None);
    }

    #[test]
    fn equal_values_share_rank() {
        let a = fixture(5.0, 0, 120, true);
        let b = fixture(5.0, 0, 120, true);
        let params = FleetParams {
            metrics: vec![FleetMetric::ManeuverCount],
            ..FleetParams::default()
        };
        let result = compare_fleet(&[entry("a", &a), entry("b", &b)], None, &params).unwrap();
        let ranks: Vec<_> = result.rankings[0].ranking.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![Some(1), Some(1)]);
    }

    #[test]
    fn elapsed_alignment_compares_across_days() {
        let early = fixture(5.0, 0, 300, true);
        let late = fixture(5.0, 86_400, 300, true);
        let result = compare_fleet(
            &[entry("a", &early), entry("b", &late)],
            Some(FleetWindow::Elapsed { duration_s: 300.0 }),
            &FleetParams::default(),
        )
        .unwrap();
        for s in &result.sailors {
            assert!((s.coverage.fraction - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn head_to_head_tie_band() {
        let ghost = fixture(5.0, 0, 300, false);
        let close = fixture(5.0, 0, 301, false);
        let slow = fixture(5.0, 0, 320, false);
        let fast = fixture(5.0, 0, 250, false);
        let params = FleetParams::default();
        let g = entry("ghost", &ghost);
        assert_eq!(head_to_head(&g, &entry("c", &close), &params).unwrap().result, HeadToHeadResult::Tied);
        assert_eq!(head_to_head(&g, &entry("s", &slow), &params).unwrap().result, HeadToHeadResult::Lost);
        let won = head_to_head(&g, &entry("f", &fast), &params).unwrap();
        assert_eq!(won.result, HeadToHeadResult::Won);
        assert!((won.diff_s + 50.0).abs() < 1e-9);
    }

    #[test]
    fn head_to_head_tracks_lead_at_equal_distance() {
        let ghost = fixture(5.0, 0, 300, false);
        let attempt = fixture(6.0, 0, 300, false);
        let mark = ghost.series.samples().last().unwrap().position();
        let g = FleetEntry {
            mark: Some(mark),
            ..entry("ghost", &ghost)
        };
        let a = FleetEntry {
            mark: Some(mark),
            ..entry("attempt", &attempt)
        };
        let duel = head_to_head(&g, &a, &FleetParams::default()).unwrap();
        assert_eq!(duel.result, HeadToHeadResult::Won);
        assert!(duel.attempt_elapsed_s < 250.0);
        assert_eq!(duel.max_deficit_s, 0.0);
        assert!((duel.max_lead_s + duel.diff_s).abs() < 1.0, "lead {}", duel.max_lead_s);
        assert_eq!(duel.difficulty, Difficulty::Medium);
    }

    #[test]
    fn difficulty_follows_ghost_speed() {
        assert_eq!(Difficulty::from_avg_sog(4.2), Difficulty::Easy);
        assert_eq!(Difficulty::from_avg_sog(5.0), Difficulty::Medium);
        assert_eq!(Difficulty::from_avg_sog(9.5), Difficulty::Hard);
    }
}
