//! Per-sailor / per-class performance baselines and anomaly detection.
//!
//! A baseline is rebuilt from scratch from historical observations, keyed by
//! (true-wind-angle bucket, wind band). [`BaselineStore`] serves the current
//! baseline to concurrent readers and swaps in complete rebuilds atomically.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::geo::norm180;
use crate::maneuver::ManeuverReport;
use crate::normalize::TelemetrySeries;
use crate::polar::WindBand;
use crate::wind::WindAnalysis;
use crate::{sha256_hex, SailError};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BaselineParams {
    /// Width of an absolute-TWA bucket.
    pub twa_bucket_deg: f64,
    /// Baseline buckets with fewer historical samples are dropped.
    pub min_bucket_samples: usize,
    /// Session buckets with fewer samples are not assessed.
    pub min_session_bucket_samples: usize,
    /// Sessions a sailor needs before getting a personal baseline.
    pub min_sailor_sessions: usize,
    /// Spread units beyond which a bucket is anomalous.
    pub anomaly_threshold: f64,
    /// Floor on the spread used for scoring.
    pub min_spread_kn: f64,
    pub max_age_days: i64,
    pub exclude_maneuvers: bool,
}

impl Default for BaselineParams {
    fn default() -> Self {
        Self {
            twa_bucket_deg: 15.0,
            min_bucket_samples: 10,
            min_session_bucket_samples: 5,
            min_sailor_sessions: 3,
            anomaly_threshold: 2.0,
            min_spread_kn: 0.05,
            max_age_days: 180,
            exclude_maneuvers: true,
        }
    }
}

/// One steady-state speed sample with its wind context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub timestamp: DateTime<Utc>,
    /// Absolute true wind angle.
    pub twa_deg: f64,
    pub tws_kn: f64,
    pub speed_kn: f64,
}

/// Observations from a session, excluding samples without wind speed and,
/// optionally, samples inside confirmed maneuvers.
pub fn observations(
    series: &TelemetrySeries,
    wind: &WindAnalysis,
    maneuvers: &ManeuverReport,
    params: &BaselineParams,
) -> Vec<Observation> {
    series
        .samples()
        .iter()
        .enumerate()
        .filter_map(|(i, s)| {
            let est = wind.at(i)?;
            let tws = est.tws_kn?;
            if params.exclude_maneuvers && maneuvers.covers(s.timestamp) {
                return None;
            }
            Some(Observation {
                timestamp: s.timestamp,
                twa_deg: norm180(est.smoothed_twd_deg - s.heading()).abs(),
                tws_kn: tws,
                speed_kn: s.sog_kn,
            })
        })
        .collect()
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoricalSession {
    pub session_id: String,
    pub sailor_id: String,
    pub boat_class: Option<String>,
    pub ended_at: DateTime<Utc>,
    pub observations: Vec<Observation>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum BaselineKey {
    Sailor(String),
    BoatClass(String),
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    /// Index of the TWA bucket: `[i * width, (i + 1) * width)`.
    pub twa_bucket: u16,
    pub band: WindBand,
}

impl BucketKey {
    pub fn of(obs: &Observation, twa_bucket_deg: f64) -> Self {
        let twa = obs.twa_deg.clamp(0.0, 179.999);
        Self {
            twa_bucket: (twa / twa_bucket_deg).floor() as u16,
            band: WindBand::from_tws(obs.tws_kn),
        }
    }

    pub fn twa_range(&self, twa_bucket_deg: f64) -> (f64, f64) {
        let lo = self.twa_bucket as f64 * twa_bucket_deg;
        (lo, (lo + twa_bucket_deg).min(180.0))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BucketBaseline {
    #[serde(flatten)]
    pub key: BucketKey,
    pub mean_kn: f64,
    pub std_kn: f64,
    pub n: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BaselineModel {
    pub key: BaselineKey,
    pub sessions: usize,
    /// Sorted by bucket key.
    pub buckets: Vec<BucketBaseline>,
}

impl BaselineModel {
    pub fn bucket(&self, key: BucketKey) -> Option<&BucketBaseline> {
        self.buckets
            .binary_search_by(|b| b.key.cmp(&key))
            .ok()
            .map(|i| &self.buckets[i])
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BaselineSet {
    /// SHA-256 of the bucket width and models; identical history gives an
    /// identical version.
    pub version: String,
    /// Bumped by every store swap.
    pub generation: u64,
    /// Latest session end time included.
    pub built_through: Option<DateTime<Utc>>,
    pub twa_bucket_deg: f64,
    /// Sorted by key.
    pub models: Vec<BaselineModel>,
}

impl BaselineSet {
    pub fn empty(twa_bucket_deg: f64) -> Self {
        let mut set = Self {
            version: String::new(),
            generation: 0,
            built_through: None,
            twa_bucket_deg,
            models: Vec::new(),
        };
        set.version = set.content_hash();
        set
    }

    fn content_hash(&self) -> String {
        let bytes = serde_json::to_vec(&(self.twa_bucket_deg, &self.models)).unwrap_or_default();
        sha256_hex(&bytes)
    }

    pub fn model(&self, key: &BaselineKey) -> Option<&BaselineModel> {
        self.models
            .binary_search_by(|m| m.key.cmp(key))
            .ok()
            .map(|i| &self.models[i])
    }

    /// `Aged` once the newest session in the set is more than `max_age_days` old.
    pub fn age_at(&self, now: DateTime<Utc>, max_age_days: i64) -> Option<StaleReason> {
        let age_days = (now - self.built_through?).num_days();
        (age_days > max_age_days).then_some(StaleReason::Aged { age_days })
    }

    /// The sailor's own model when one exists, else the boat-class model.
    pub fn resolve(&self, sailor_id: &str, boat_class: Option<&str>) -> Option<&BaselineModel> {
        self.model(&BaselineKey::Sailor(sailor_id.to_string())).or_else(|| {
            boat_class.and_then(|c| self.model(&BaselineKey::BoatClass(c.to_string())))
        })
    }
}

/// Cooperative cancellation for long rebuilds.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Accumulator {
    n: usize,
    sum: f64,
    sum_sq: f64,
}

fn build_model(
    key: BaselineKey,
    sessions: &[&HistoricalSession],
    params: &BaselineParams,
) -> BaselineModel {
    let mut acc: BTreeMap<BucketKey, Accumulator> = BTreeMap::new();
    for session in sessions {
        for obs in &session.observations {
            let a = acc.entry(BucketKey::of(obs, params.twa_bucket_deg)).or_default();
            a.n += 1;
            a.sum += obs.speed_kn;
            a.sum_sq += obs.speed_kn * obs.speed_kn;
        }
    }
    let buckets = acc
        .into_iter()
        .filter(|(_, a)| a.n >= params.min_bucket_samples.max(1))
        .map(|(key, a)| {
            let n = a.n as f64;
            let mean = a.sum / n;
            let var = if a.n > 1 {
                ((a.sum_sq - n * mean * mean) / (n - 1.0)).max(0.0)
            } else {
                0.0
            };
            BucketBaseline {
                key,
                mean_kn: mean,
                std_kn: var.sqrt(),
                n: a.n,
            }
        })
        .collect();
    BaselineModel {
        key,
        sessions: sessions.len(),
        buckets,
    }
}

/// Full, deterministic rebuild. Units (one per sailor with enough history
/// and one per boat class) are built in parallel; `cancel` is checked before
/// each unit and a cancelled build returns [`SailError::Cancelled`].
pub fn build_baseline(
    history: &[HistoricalSession],
    params: &BaselineParams,
    cancel: &CancelFlag,
) -> Result<BaselineSet, SailError> {
    let mut sorted: Vec<&HistoricalSession> = history.iter().collect();
    sorted.sort_by(|a, b| a.session_id.cmp(&b.session_id));

    let mut units: BTreeMap<BaselineKey, Vec<&HistoricalSession>> = BTreeMap::new();
    for &s in &sorted {
        units
            .entry(BaselineKey::Sailor(s.sailor_id.clone()))
            .or_default()
            .push(s);
        if let Some(class) = &s.boat_class {
            units
                .entry(BaselineKey::BoatClass(class.clone()))
                .or_default()
                .push(s);
        }
    }
    units.retain(|key, sessions| match key {
        BaselineKey::Sailor(_) => sessions.len() >= params.min_sailor_sessions,
        BaselineKey::BoatClass(_) => true,
    });

    let units: Vec<(BaselineKey, Vec<&HistoricalSession>)> = units.into_iter().collect();
    let models = units
        .par_iter()
        .map(|(key, sessions)| {
            if cancel.is_cancelled() {
                return Err(SailError::Cancelled);
            }
            Ok(build_model(key.clone(), sessions, params))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut set = BaselineSet {
        version: String::new(),
        generation: 0,
        built_through: sorted.iter().map(|s| s.ended_at).max(),
        twa_bucket_deg: params.twa_bucket_deg,
        models,
    };
    set.version = set.content_hash();
    debug!(
        "baseline: built {} models from {} sessions (version {})",
        set.models.len(),
        history.len(),
        short(&set.version)
    );
    Ok(set)
}

fn short(version: &str) -> &str {
    version.get(..12).unwrap_or(version)
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Minor,
    Moderate,
    Severe,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PerformanceAnomaly {
    pub session_id: String,
    #[serde(flatten)]
    pub bucket: BucketKey,
    pub twa_range_deg: (f64, f64),
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub observed_mean_kn: f64,
    pub expected_mean_kn: f64,
    pub expected_std_kn: f64,
    pub deviation_kn: f64,
    /// Deviation in spread units; signed.
    pub z_score: f64,
    /// `|z_score|`.
    pub severity: f64,
    pub level: SeverityLevel,
    pub n: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InsufficientBucket {
    #[serde(flatten)]
    pub bucket: BucketKey,
    pub n: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    Superseded { current_version: String },
    Aged { age_days: i64 },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AnomalyReport {
    pub session_id: String,
    pub baseline_version: String,
    pub baseline_generation: u64,
    /// Model the session was scored against; `None` when neither the sailor
    /// nor the class has one.
    pub baseline_key: Option<BaselineKey>,
    pub anomalies: Vec<PerformanceAnomaly>,
    /// Session buckets with no matching baseline data.
    pub baseline_insufficient: Vec<InsufficientBucket>,
    pub assessed_buckets: usize,
    pub stale: Option<StaleReason>,
}

/// Score a session's buckets against the resolved baseline model.
pub fn detect_anomalies(
    session: &HistoricalSession,
    baseline: &BaselineSet,
    params: &BaselineParams,
) -> AnomalyReport {
    let width = baseline.twa_bucket_deg;
    let model = baseline.resolve(&session.sailor_id, session.boat_class.as_deref());

    let mut grouped: BTreeMap<BucketKey, Vec<&Observation>> = BTreeMap::new();
    for obs in &session.observations {
        grouped.entry(BucketKey::of(obs, width)).or_default().push(obs);
    }

    let mut anomalies = Vec::new();
    let mut insufficient = Vec::new();
    let mut assessed = 0;
    for (key, obs) in grouped {
        if obs.len() < params.min_session_bucket_samples {
            continue;
        }
        let Some(expected) = model.and_then(|m| m.bucket(key)) else {
            insufficient.push(InsufficientBucket { bucket: key, n: obs.len() });
            continue;
        };
        assessed += 1;
        let observed = obs.iter().map(|o| o.speed_kn).sum::<f64>() / obs.len() as f64;
        let deviation = observed - expected.mean_kn;
        let z = deviation / expected.std_kn.max(params.min_spread_kn);
        if z.abs() < params.anomaly_threshold {
            continue;
        }
        let level = if z.abs() >= 2.0 * params.anomaly_threshold {
            SeverityLevel::Severe
        } else if z.abs() >= 1.5 * params.anomaly_threshold {
            SeverityLevel::Moderate
        } else {
            SeverityLevel::Minor
        };
        anomalies.push(PerformanceAnomaly {
            session_id: session.session_id.clone(),
            bucket: key,
            twa_range_deg: key.twa_range(width),
            start_ts: obs.iter().map(|o| o.timestamp).min().unwrap_or(session.ended_at),
            end_ts: obs.iter().map(|o| o.timestamp).max().unwrap_or(session.ended_at),
            observed_mean_kn: observed,
            expected_mean_kn: expected.mean_kn,
            expected_std_kn: expected.std_kn,
            deviation_kn: deviation,
            z_score: z,
            severity: z.abs(),
            level,
            n: obs.len(),
        });
    }
    if !insufficient.is_empty() {
        debug!(
            "baseline: {} buckets of session {} have no baseline data",
            insufficient.len(),
            session.session_id
        );
    }
    AnomalyReport {
        session_id: session.session_id.clone(),
        baseline_version: baseline.version.clone(),
        baseline_generation: baseline.generation,
        baseline_key: model.map(|m| m.key.clone()),
        anomalies,
        baseline_insufficient: insufficient,
        assessed_buckets: assessed,
        stale: None,
    }
}

/// Holds the current baseline. Readers clone an `Arc` snapshot; rebuilds are
/// serialized and swap in a complete set or leave the current one untouched.
pub struct BaselineStore {
    current: RwLock<Arc<BaselineSet>>,
    rebuild_lock: Mutex<()>,
    params: BaselineParams,
}

impl BaselineStore {
    pub fn new(initial: BaselineSet, params: BaselineParams) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            rebuild_lock: Mutex::new(()),
            params,
        }
    }

    pub fn snapshot(&self) -> Result<Arc<BaselineSet>, SailError> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .map_err(|_| SailError::BaselineStore("baseline lock poisoned".into()))
    }

    pub fn rebuild(
        &self,
        history: &[HistoricalSession],
        cancel: &CancelFlag,
    ) -> Result<Arc<BaselineSet>, SailError> {
        let _serial = self
            .rebuild_lock
            .lock()
            .map_err(|_| SailError::BaselineStore("rebuild lock poisoned".into()))?;
        let previous = self.snapshot()?;
        let mut next = match build_baseline(history, &self.params, cancel) {
            Ok(set) => set,
            Err(err) => {
                warn!("baseline: rebuild abandoned ({err}); keeping {}", short(&previous.version));
                return Err(err);
            }
        };
        next.generation = previous.generation + 1;
        let next = Arc::new(next);
        {
            let mut guard = self
                .current
                .write()
                .map_err(|_| SailError::BaselineStore("baseline lock poisoned".into()))?;
            *guard = Arc::clone(&next);
        }
        info!(
            "baseline: swapped in generation {} ({} models)",
            next.generation,
            next.models.len()
        );
        Ok(next)
    }

    /// Why a report computed earlier should no longer be trusted, if at all.
    pub fn check_staleness(
        &self,
        report: &AnomalyReport,
        now: DateTime<Utc>,
    ) -> Result<Option<StaleReason>, SailError> {
        let current = self.snapshot()?;
        if report.baseline_version != current.version {
            return Ok(Some(StaleReason::Superseded {
                current_version: current.version.clone(),
            }));
        }
        Ok(current.age_at(now, self.params.max_age_days))
    }

    /// Scores `session` against the current set, flagging the report when
    /// that set has aged past `max_age_days` at `now`.
    pub fn detect_anomalies(
        &self,
        session: &HistoricalSession,
        now: DateTime<Utc>,
    ) -> Result<AnomalyReport, SailError> {
        let current = self.snapshot()?;
        let mut report = detect_anomalies(session, &current, &self.params);
        report.stale = current.age_at(now, self.params.max_age_days);
        if let Some(reason) = &report.stale {
            warn!("baseline: scoring {} against a stale baseline ({reason:?})", session.session_id);
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    /// 40 observations per (TWA, TWS) cell with a fixed ±0.2 kn wobble.
    fn session(id: &str, sailor: &str, class: &str, offset_kn: f64) -> HistoricalSession {
        let mut observations = Vec::new();
        let mut k = 0;
        for &twa in &[40.0, 95.0, 150.0] {
            for &tws in &[8.0, 14.0] {
                for j in 0..40 {
                    let wobble = if j % 2 == 0 { 0.2 } else { -0.2 };
                    observations.push(Observation {
                        timestamp: t0() + Duration::seconds(k),
                        twa_deg: twa,
                        tws_kn: tws,
                        speed_kn: 3.0 + tws / 4.0 + twa / 100.0 + wobble + offset_kn,
                    });
                    k += 1;
                }
            }
        }
        HistoricalSession {
            session_id: id.into(),
            sailor_id: sailor.into(),
            boat_class: Some(class.into()),
            ended_at: t0(),
            observations,
        }
    }

    fn history() -> Vec<HistoricalSession> {
        vec![
            session("s1", "alex", "Laser", 0.0),
            session("s2", "alex", "Laser", 0.0),
            session("s3", "alex", "Laser", 0.0),
            session("s4", "sam", "Laser", 0.3),
        ]
    }

    #[test]
    fn build_is_deterministic_and_order_independent() {
        let params = BaselineParams::default();
        let a = build_baseline(&history(), &params, &CancelFlag::new()).unwrap();
        let mut reversed = history();
        reversed.reverse();
        let b = build_baseline(&reversed, &params, &CancelFlag::new()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.version.len(), 64);
    }

    #[test]
    fn sailor_model_needs_enough_sessions() {
        let set = build_baseline(&history(), &BaselineParams::default(), &CancelFlag::new()).unwrap();
        assert!(set.model(&BaselineKey::Sailor("alex".into())).is_some());
        assert!(set.model(&BaselineKey::Sailor("sam".into())).is_none());
        let resolved = set.resolve("sam", Some("Laser")).unwrap();
        assert_eq!(resolved.key, BaselineKey::BoatClass("Laser".into()));
        assert_eq!(resolved.sessions, 4);
    }

    #[test]
    fn offset_session_flags_every_bucket_proportionally() {
        let params = BaselineParams::default();
        let set = build_baseline(&history(), &params, &CancelFlag::new()).unwrap();
        let one = detect_anomalies(&session("x1", "alex", "Laser", -1.0), &set, &params);
        let two = detect_anomalies(&session("x2", "alex", "Laser", -2.0), &set, &params);
        assert_eq!(one.baseline_key, Some(BaselineKey::Sailor("alex".into())));
        assert_eq!(one.assessed_buckets, 6);
        assert_eq!(one.anomalies.len(), 6);
        assert_eq!(two.anomalies.len(), 6);
        for (a, b) in one.anomalies.iter().zip(&two.anomalies) {
            assert!(a.z_score < 0.0);
            assert!((b.severity / a.severity - 2.0).abs() < 1e-6);
        }
        assert_eq!(one.baseline_version, set.version);
    }

    #[test]
    fn unmatched_bucket_is_insufficient_not_anomalous() {
        let params = BaselineParams::default();
        let set = build_baseline(&history(), &params, &CancelFlag::new()).unwrap();
        let mut s = session("x", "alex", "Laser", 0.0);
        for o in &mut s.observations {
            o.tws_kn = 25.0;
        }
        let report = detect_anomalies(&s, &set, &params);
        assert!(report.anomalies.is_empty());
        assert_eq!(report.baseline_insufficient.len(), 3);
        assert!(report
            .baseline_insufficient
            .iter()
            .all(|b| b.bucket.band == WindBand::Strong));
    }

    #[test]
    fn cancelled_rebuild_leaves_store_untouched() {
        let params = BaselineParams::default();
        let initial = build_baseline(&history(), &params, &CancelFlag::new()).unwrap();
        let store = BaselineStore::new(initial.clone(), params);
        let cancel = CancelFlag::new();
        cancel.cancel();
        assert!(matches!(
            store.rebuild(&history(), &cancel),
            Err(SailError::Cancelled)
        ));
        assert_eq!(*store.snapshot().unwrap(), initial);
    }

    #[test]
    fn rebuild_swaps_and_marks_old_reports_stale() {
        let params = BaselineParams::default();
        let store = BaselineStore::new(BaselineSet::empty(params.twa_bucket_deg), params.clone());
        let first = store.rebuild(&history()[..3], &CancelFlag::new()).unwrap();
        assert_eq!(first.generation, 1);
        let report = detect_anomalies(&session("x", "alex", "Laser", -1.0), &first, &params);
        assert_eq!(store.check_staleness(&report, t0()).unwrap(), None);

        let second = store.rebuild(&history(), &CancelFlag::new()).unwrap();
        assert_eq!(second.generation, 2);
        assert!(matches!(
            store.check_staleness(&report, t0()).unwrap(),
            Some(StaleReason::Superseded { .. })
        ));

        let fresh = detect_anomalies(&session("y", "alex", "Laser", -1.0), &second, &params);
        assert!(matches!(
            store.check_staleness(&fresh, t0() + Duration::days(365)).unwrap(),
            Some(StaleReason::Aged { age_days: 365 })
        ));
    }

    #[test]
    fn store_scoring_flags_aged_baseline() {
        let params = BaselineParams::default();
        let set = build_baseline(&history(), &params, &CancelFlag::new()).unwrap();
        let store = BaselineStore::new(set, params);
        let slow = session("x", "alex", "Laser", -1.0);

        let report = store.detect_anomalies(&slow, t0() + Duration::days(30)).unwrap();
        assert_eq!(report.stale, None);
        assert!(!report.anomalies.is_empty());

        let report = store.detect_anomalies(&slow, t0() + Duration::days(4 * 365)).unwrap();
        assert_eq!(report.stale, Some(StaleReason::Aged { age_days: 4 * 365 }));
        assert!(!report.anomalies.is_empty());
    }

    #[test]
    fn concurrent_readers_see_whole_sets() {
        let params = BaselineParams::default();
        let store = Arc::new(BaselineStore::new(BaselineSet::empty(15.0), params));
        std::thread::scope(|scope| {
            let writer = Arc::clone(&store);
            scope.spawn(move || {
                for _ in 0..5 {
                    writer.rebuild(&history(), &CancelFlag::new()).unwrap();
                }
            });
            for _ in 0..4 {
                let reader = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..50 {
                        let snap = reader.snapshot().unwrap();
                        assert!(snap.models.is_empty() || snap.models.len() == 2);
                    }
                });
            }
        });
        assert_eq!(store.snapshot().unwrap().generation, 5);
    }
}
