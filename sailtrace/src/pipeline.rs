//! Per-session pipeline: normalize, estimate wind, detect maneuvers, compute
//! tactical snapshots and baseline observations.

use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::baseline::{observations, HistoricalSession, Observation};
use crate::fleet::FleetEntry;
use crate::maneuver::{detect_maneuvers, ManeuverReport};
use crate::normalize::{normalize, TelemetrySeries};
use crate::polar::PerformanceCurve;
use crate::tactics::{snapshots, TacticalSnapshot};
use crate::wind::{analyze_wind, WindAnalysis};
use crate::{Params, SailError, TelemetryFix};

pub use crate::tactics::CourseConfig;

/// One session as handed over by the storage layer.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SessionInput {
    pub session_id: String,
    pub sailor_id: String,
    #[serde(default)]
    pub course: CourseConfig,
    pub fixes: Vec<TelemetryFix>,
}

/// Everything derived from one session. Pure function of the input, the
/// params (identified by `params_hash`) and the performance curve.
#[derive(Clone, Debug, Serialize)]
pub struct SessionAnalysis {
    pub session_id: String,
    pub sailor_id: String,
    pub params_hash: String,
    pub course: CourseConfig,
    pub series: TelemetrySeries,
    pub wind: WindAnalysis,
    pub maneuvers: ManeuverReport,
    pub snapshots: Vec<TacticalSnapshot>,
    pub observations: Vec<Observation>,
}

impl SessionAnalysis {
    pub fn fleet_entry(&self) -> FleetEntry<'_> {
        FleetEntry {
            sailor_id: &self.sailor_id,
            session_id: &self.session_id,
            series: &self.series,
            wind: &self.wind,
            maneuvers: &self.maneuvers,
            mark: self.course.mark,
        }
    }

    /// Baseline-ready view of this session; `None` for an empty series.
    pub fn historical(&self) -> Option<HistoricalSession> {
        Some(HistoricalSession {
            session_id: self.session_id.clone(),
            sailor_id: self.sailor_id.clone(),
            boat_class: self.course.boat_class.clone(),
            ended_at: self.series.end()?,
            observations: self.observations.clone(),
        })
    }
}

pub fn analyze_session(
    input: &SessionInput,
    params: &Params,
    curve: Option<&dyn PerformanceCurve>,
) -> Result<SessionAnalysis, SailError> {
    params.validate()?;
    let params_hash = params.hash_sha256()?;

    let t = Instant::now();
    let series = normalize(&input.fixes, &params.normalize)?;
    debug!("{}: normalize {:.1} ms", input.session_id, ms(t));

    let t = Instant::now();
    let wind = analyze_wind(&series, &params.wind);
    debug!("{}: wind {:.1} ms", input.session_id, ms(t));

    let t = Instant::now();
    let maneuvers = detect_maneuvers(&series, &wind, &input.course, &params.maneuver);
    debug!("{}: maneuvers {:.1} ms", input.session_id, ms(t));

    let t = Instant::now();
    let snapshots = snapshots(&series, &wind, &input.course, curve, &params.tactics);
    let observations = observations(&series, &wind, &maneuvers, &params.baseline);
    debug!("{}: tactics {:.1} ms", input.session_id, ms(t));

    info!(
        "{}: {} samples, {} gaps, {} rejected, {} maneuvers, wind {}",
        input.session_id,
        series.len(),
        series.gaps().len(),
        series.rejected().len(),
        maneuvers.maneuvers.len(),
        if wind.is_available() { "available" } else { "unavailable" }
    );

    Ok(SessionAnalysis {
        session_id: input.session_id.clone(),
        sailor_id: input.sailor_id.clone(),
        params_hash,
        course: input.course.clone(),
        series,
        wind,
        maneuvers,
        snapshots,
        observations,
    })
}

/// Sessions are independent; each is analyzed on the rayon pool. Results come
/// back in input order.
pub fn analyze_sessions(
    inputs: &[SessionInput],
    params: &Params,
    curve: Option<&dyn PerformanceCurve>,
) -> Vec<Result<SessionAnalysis, SailError>> {
    inputs
        .par_iter()
        .map(|input| analyze_session(input, params, curve))
        .collect()
}

fn ms(t: Instant) -> f64 {
    t.elapsed().as_secs_f64() * 1000.0
}
