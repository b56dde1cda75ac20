//! Wind pattern analysis: per-sample true wind estimation, smoothing, shift
//! detection and oscillation extraction.

use chrono::{DateTime, Utc};
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::geo::{bearing_unit, circular_mean, signed_delta, vector_bearing};
use crate::normalize::{Sample, TelemetrySeries};
use crate::SailError;

const HEADING_BINS: usize = 36;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindParams {
    /// Use external wind readings verbatim when present.
    pub trust_external: bool,
    /// Centered circular moving-average window (seconds).
    pub smooth_window_s: f64,
    pub shift_threshold_deg: f64,
    pub min_shift_duration_s: f64,
    pub min_oscillation_period_s: f64,
    pub max_oscillation_period_s: f64,
    pub min_oscillation_cycles: f64,
    pub min_oscillation_amplitude_deg: f64,
    /// Samples slower than this are ignored by the heading-signature estimate.
    pub signature_min_speed_kn: f64,
    /// Minimum share of moving samples each close-hauled cluster must hold.
    pub signature_min_share: f64,
    pub signature_min_tack_angle_deg: f64,
    pub signature_max_tack_angle_deg: f64,
}

impl Default for WindParams {
    fn default() -> Self {
        Self {
            trust_external: true,
            smooth_window_s: 30.0,
            shift_threshold_deg: 10.0,
            min_shift_duration_s: 60.0,
            min_oscillation_period_s: 120.0,
            max_oscillation_period_s: 1200.0,
            min_oscillation_cycles: 2.0,
            min_oscillation_amplitude_deg: 3.0,
            signature_min_speed_kn: 1.5,
            signature_min_share: 0.15,
            signature_min_tack_angle_deg: 60.0,
            signature_max_tack_angle_deg: 120.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindSource {
    External,
    Apparent,
    HeadingSignature,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindEstimate {
    /// Unsmoothed true wind direction (from), degrees.
    pub twd_deg: f64,
    /// Smoothed true wind direction; this is what downstream stages use.
    pub smoothed_twd_deg: f64,
    /// Unknown when derived from heading signatures only.
    pub tws_kn: Option<f64>,
    pub source: WindSource,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShiftDirection {
    /// Clockwise.
    Veer,
    /// Counter-clockwise.
    Back,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindShiftEvent {
    pub start: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
    pub from_deg: f64,
    pub to_deg: f64,
    /// Signed, clockwise positive.
    pub magnitude_deg: f64,
    pub direction: ShiftDirection,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OscillationPattern {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub period_s: f64,
    pub amplitude_deg: f64,
    pub mean_direction_deg: f64,
    pub cycles: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WindAvailability {
    Available {
        external: usize,
        apparent: usize,
        heading_signature: usize,
        missing: usize,
    },
    Unavailable,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindAnalysis {
    pub availability: WindAvailability,
    /// One entry per series sample.
    pub estimates: Vec<Option<WindEstimate>>,
    pub mean_direction_deg: Option<f64>,
    pub shifts: Vec<WindShiftEvent>,
    pub oscillations: Vec<OscillationPattern>,
}

impl WindAnalysis {
    pub fn unavailable(len: usize) -> Self {
        Self {
            availability: WindAvailability::Unavailable,
            estimates: vec![None; len],
            mean_direction_deg: None,
            shifts: Vec::new(),
            oscillations: Vec::new(),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.availability, WindAvailability::Available { .. })
    }

    pub fn require(&self) -> Result<(), SailError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(SailError::MissingWindData(
                "no external, apparent or heading-derived wind in session".into(),
            ))
        }
    }

    pub fn at(&self, index: usize) -> Option<&WindEstimate> {
        self.estimates.get(index).and_then(|e| e.as_ref())
    }

    /// Smoothed direction at a sample.
    pub fn twd_at(&self, index: usize) -> Option<f64> {
        self.at(index).map(|e| e.smoothed_twd_deg)
    }
}

/// True wind from apparent wind and boat motion.
/// Returns `(twd_deg, tws_kn)`; `None` in a flat calm.
pub fn true_from_apparent(
    heading_deg: f64,
    sog_kn: f64,
    cog_deg: f64,
    awa_deg: f64,
    aws_kn: f64,
) -> Option<(f64, f64)> {
    // Vectors point where the air moves to.
    let (ax, ay) = bearing_unit(heading_deg + awa_deg);
    let (bx, by) = bearing_unit(cog_deg);
    let tx = -aws_kn * ax + sog_kn * bx;
    let ty = -aws_kn * ay + sog_kn * by;
    let tws = (tx * tx + ty * ty).sqrt();
    if tws < 1e-6 {
        return None;
    }
    Some((vector_bearing(-tx, -ty), tws))
}

fn estimate_sample(s: &Sample, params: &WindParams) -> Option<(f64, Option<f64>, WindSource)> {
    if params.trust_external {
        if let Some(w) = s.wind {
            return Some((w.direction_deg, Some(w.speed_kn), WindSource::External));
        }
    }
    if let Some(a) = s.apparent {
        return true_from_apparent(s.heading(), s.sog_kn, s.cog_deg, a.angle_deg, a.speed_kn)
            .map(|(d, v)| (d, Some(v), WindSource::Apparent));
    }
    None
}

/// Session-level wind estimate from the two dominant close-hauled heading
/// clusters. Assumes the clusters are upwind tacks.
pub fn heading_signature(samples: &[Sample], params: &WindParams) -> Option<f64> {
    let headings: Vec<f64> = samples
        .iter()
        .filter(|s| s.sog_kn >= params.signature_min_speed_kn)
        .map(|s| s.heading())
        .collect();
    if headings.is_empty() {
        return None;
    }
    let bin_width = 360.0 / HEADING_BINS as f64;
    let mut counts = [0usize; HEADING_BINS];
    for h in &headings {
        counts[((h / bin_width) as usize).min(HEADING_BINS - 1)] += 1;
    }
    let center = |bin: usize| (bin as f64 + 0.5) * bin_width;
    let min_count = (params.signature_min_share * headings.len() as f64).ceil() as usize;

    let first = (0..HEADING_BINS).max_by_key(|&b| (counts[b], std::cmp::Reverse(b)))?;
    let second = (0..HEADING_BINS)
        .filter(|&b| {
            let sep = signed_delta(center(first), center(b)).abs();
            sep >= params.signature_min_tack_angle_deg && sep <= params.signature_max_tack_angle_deg
        })
        .max_by_key(|&b| (counts[b], std::cmp::Reverse(b)))?;
    if counts[first] < min_count.max(1) || counts[second] < min_count.max(1) {
        return None;
    }
    let cluster_mean = |bin: usize| {
        circular_mean(
            headings
                .iter()
                .copied()
                .filter(|h| signed_delta(center(bin), *h).abs() <= bin_width * 1.5),
        )
    };
    let a = cluster_mean(first)?;
    let b = cluster_mean(second)?;
    Some(crate::geo::norm360(a + signed_delta(a, b) / 2.0))
}

/// Estimate wind for every sample and extract shifts and oscillations.
/// Never fails: a session without any wind signal yields
/// [`WindAvailability::Unavailable`].
pub fn analyze_wind(series: &TelemetrySeries, params: &WindParams) -> WindAnalysis {
    let samples = series.samples();
    let mut raw: Vec<Option<(f64, Option<f64>, WindSource)>> =
        samples.iter().map(|s| estimate_sample(s, params)).collect();

    if raw.iter().any(Option::is_none) {
        if let Some(twd) = heading_signature(samples, params) {
            debug!("wind: heading-signature estimate {:.1}°", twd);
            for slot in raw.iter_mut().filter(|r| r.is_none()) {
                *slot = Some((twd, None, WindSource::HeadingSignature));
            }
        }
    }

    let (mut external, mut apparent, mut signature, mut missing) = (0, 0, 0, 0);
    for r in &raw {
        match r {
            Some((_, _, WindSource::External)) => external += 1,
            Some((_, _, WindSource::Apparent)) => apparent += 1,
            Some((_, _, WindSource::HeadingSignature)) => signature += 1,
            None => missing += 1,
        }
    }
    if missing == raw.len() {
        warn!("wind: no usable wind signal in {} samples", raw.len());
        return WindAnalysis::unavailable(raw.len());
    }

    let window = ((params.smooth_window_s / series.interval_s()).round() as usize).max(1);
    let mut estimates: Vec<Option<WindEstimate>> = vec![None; raw.len()];
    let mut shifts = Vec::new();
    let mut oscillations = Vec::new();

    for range in series.segment_ranges() {
        let seg_raw: Vec<Option<f64>> = raw[range.clone()].iter().map(|r| r.map(|x| x.0)).collect();
        let smoothed = circular_smooth(&seg_raw, window);
        for (k, i) in range.clone().enumerate() {
            if let (Some((twd, tws, source)), Some(sm)) = (raw[i], smoothed[k]) {
                estimates[i] = Some(WindEstimate {
                    twd_deg: twd,
                    smoothed_twd_deg: sm,
                    tws_kn: tws,
                    source,
                });
            }
        }
        let seg_samples = &samples[range];
        shifts.extend(detect_shifts(seg_samples, &smoothed, params));
        if let Some(osc) = detect_oscillation(seg_samples, &smoothed, params) {
            oscillations.push(osc);
        }
    }

    let mean_direction_deg = circular_mean(estimates.iter().flatten().map(|e| e.smoothed_twd_deg));
    WindAnalysis {
        availability: WindAvailability::Available {
            external,
            apparent,
            heading_signature: signature,
            missing,
        },
        estimates,
        mean_direction_deg,
        shifts,
        oscillations,
    }
}

/// Centered circular moving average over the available values.
fn circular_smooth(values: &[Option<f64>], window: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let radius = window / 2;
    let sin = Array1::from_iter(values.iter().map(|v| v.map_or(0.0, |d| d.to_radians().sin())));
    let cos = Array1::from_iter(values.iter().map(|v| v.map_or(0.0, |d| d.to_radians().cos())));
    let prefix = |a: &Array1<f64>| {
        let mut out = Array1::<f64>::zeros(n + 1);
        for i in 0..n {
            out[i + 1] = out[i] + a[i];
        }
        out
    };
    let (ps, pc) = (prefix(&sin), prefix(&cos));
    (0..n)
        .map(|i| {
            values[i]?;
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(n);
            let s = ps[hi] - ps[lo];
            let c = pc[hi] - pc[lo];
            if s.abs() < 1e-12 && c.abs() < 1e-12 {
                values[i]
            } else {
                Some(crate::geo::norm360(s.atan2(c).to_degrees()))
            }
        })
        .collect()
}

fn detect_shifts(
    samples: &[Sample],
    smoothed: &[Option<f64>],
    params: &WindParams,
) -> Vec<WindShiftEvent> {
    let mut events = Vec::new();
    let mut reference: Option<f64> = None;
    let mut candidate: Option<(usize, f64)> = None;

    for (i, value) in smoothed.iter().enumerate() {
        let Some(d) = *value else {
            candidate = None;
            continue;
        };
        let Some(reference_deg) = reference else {
            reference = Some(d);
            continue;
        };
        let dev = signed_delta(reference_deg, d);
        if dev.abs() < params.shift_threshold_deg {
            candidate = None;
            continue;
        }
        let start = match candidate {
            Some((start, sign)) if sign == dev.signum() => start,
            _ => {
                candidate = Some((i, dev.signum()));
                i
            }
        };
        if samples[i].offset_s - samples[start].offset_s >= params.min_shift_duration_s {
            let to = circular_mean(smoothed[start..=i].iter().flatten().copied()).unwrap_or(d);
            let magnitude = signed_delta(reference_deg, to);
            events.push(WindShiftEvent {
                start: samples[start].timestamp,
                confirmed_at: samples[i].timestamp,
                from_deg: reference_deg,
                to_deg: to,
                magnitude_deg: magnitude,
                direction: if magnitude >= 0.0 {
                    ShiftDirection::Veer
                } else {
                    ShiftDirection::Back
                },
            });
            reference = Some(to);
            candidate = None;
        }
    }
    events
}

fn detect_oscillation(
    samples: &[Sample],
    smoothed: &[Option<f64>],
    params: &WindParams,
) -> Option<OscillationPattern> {
    let mean = circular_mean(smoothed.iter().flatten().copied())?;
    let hysteresis = params.min_oscillation_amplitude_deg / 2.0;

    let mut crossings: Vec<usize> = Vec::new();
    let mut peaks: Vec<f64> = Vec::new();
    let mut sign = 0.0;
    let mut peak = 0.0f64;
    for (i, value) in smoothed.iter().enumerate() {
        let Some(d) = *value else { continue };
        let dev = signed_delta(mean, d);
        if dev.abs() < hysteresis {
            peak = peak.max(dev.abs());
            continue;
        }
        if sign != 0.0 && dev.signum() != sign {
            crossings.push(i);
            peaks.push(peak);
            peak = 0.0;
        }
        sign = dev.signum();
        peak = peak.max(dev.abs());
    }

    let cycles = (crossings.len().saturating_sub(1)) as f64 / 2.0;
    if crossings.len() < 2 || cycles < params.min_oscillation_cycles {
        return None;
    }
    let halves: Vec<f64> = crossings
        .windows(2)
        .map(|w| samples[w[1]].offset_s - samples[w[0]].offset_s)
        .collect();
    let mean_half = halves.iter().sum::<f64>() / halves.len() as f64;
    let spread = (halves.iter().map(|h| (h - mean_half).powi(2)).sum::<f64>()
        / halves.len() as f64)
        .sqrt();
    let period = 2.0 * mean_half;
    // Peaks between interior crossings describe complete half-cycles.
    let inner = &peaks[1..];
    let amplitude = inner.iter().sum::<f64>() / inner.len() as f64;

    let regular = mean_half > 0.0 && spread / mean_half <= 0.5;
    if !regular
        || period < params.min_oscillation_period_s
        || period > params.max_oscillation_period_s
        || amplitude < params.min_oscillation_amplitude_deg
    {
        debug!(
            "wind: rejected oscillation candidate (period {:.0}s, amplitude {:.1}°)",
            period, amplitude
        );
        return None;
    }
    Some(OscillationPattern {
        start: samples[crossings[0]].timestamp,
        end: samples[crossings[crossings.len() - 1]].timestamp,
        period_s: period,
        amplitude_deg: amplitude,
        mean_direction_deg: mean,
        cycles,
    })
}
