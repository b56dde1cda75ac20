//! Telemetry source adapters: FIT, GPX, CSV and JSON into raw fixes.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::geo::{haversine_distance, initial_bearing, mps_to_knots};
use crate::{ApparentWind, GeoPoint, SailError, TelemetryFix, WindReading};

const SEMICIRCLE_TO_DEG: f64 = 180.0 / 2_147_483_648.0;

/// Parse fixes from bytes using the provided format hint (extension or name).
pub fn parse_fixes(input: &[u8], format: &str) -> Result<Vec<TelemetryFix>, SailError> {
    let format_lc = format.to_ascii_lowercase();
    let is = |ext: &str| format_lc == ext || format_lc.ends_with(&format!(".{ext}"));
    let fixes = if is("fit") {
        parse_fit(input)?
    } else if is("gpx") {
        parse_gpx(input)?
    } else if is("csv") {
        parse_csv(input)?
    } else if is("json") {
        serde_json::from_slice(input).map_err(|e| SailError::MalformedInput(e.to_string()))?
    } else {
        return Err(SailError::UnsupportedFormat(format.to_string()));
    };
    debug!("ingest: {} fixes from {}", fixes.len(), format);
    Ok(fixes)
}

/// A position report before missing motion fields are derived.
struct RawPoint {
    timestamp: DateTime<Utc>,
    position: GeoPoint,
    sog_kn: Option<f64>,
    cog_deg: Option<f64>,
    heading_deg: Option<f64>,
    wind: Option<WindReading>,
    apparent: Option<ApparentWind>,
}

impl RawPoint {
    fn at(timestamp: DateTime<Utc>, position: GeoPoint) -> Self {
        Self {
            timestamp,
            position,
            sog_kn: None,
            cog_deg: None,
            heading_deg: None,
            wind: None,
            apparent: None,
        }
    }
}

/// Fill SOG/COG from neighbouring positions where the source omitted them.
fn into_fixes(points: Vec<RawPoint>) -> Vec<TelemetryFix> {
    let motion = |a: &RawPoint, b: &RawPoint| {
        let dt = (b.timestamp - a.timestamp).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            return None;
        }
        let dist = haversine_distance(a.position, b.position);
        Some((mps_to_knots(dist / dt), initial_bearing(a.position, b.position)))
    };
    (0..points.len())
        .map(|i| {
            let p = &points[i];
            let derived = if i > 0 {
                motion(&points[i - 1], p)
            } else if points.len() > 1 {
                motion(p, &points[1])
            } else {
                None
            };
            let (sog, cog) = derived.unwrap_or((0.0, 0.0));
            TelemetryFix {
                timestamp: p.timestamp,
                lat: p.position.lat,
                lon: p.position.lon,
                heading_deg: p.heading_deg,
                sog_kn: p.sog_kn.unwrap_or(sog),
                cog_deg: p.cog_deg.unwrap_or(cog),
                wind: p.wind,
                apparent: p.apparent,
            }
        })
        .collect()
}

fn parse_fit(input: &[u8]) -> Result<Vec<TelemetryFix>, SailError> {
    use fitparser::de::from_bytes;
    use fitparser::profile::MesgNum;
    let records = from_bytes(input).map_err(|e| SailError::FitParse(e.to_string()))?;
    let mut out = Vec::new();

    for record in records.into_iter() {
        if record.kind() != MesgNum::Record {
            continue;
        }
        let mut timestamp: Option<DateTime<Utc>> = None;
        let (mut lat, mut lon) = (None, None);
        let mut speed_mps = None;
        let mut heading = None;
        for field in record.fields() {
            match field.name() {
                "timestamp" => {
                    if let fitparser::Value::Timestamp(ts) = field.value() {
                        timestamp = Some(ts.with_timezone(&Utc));
                    }
                }
                "position_lat" => lat = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLE_TO_DEG),
                "position_long" => lon = fit_value_to_f64(field.value()).map(|v| v * SEMICIRCLE_TO_DEG),
                "speed" | "enhanced_speed" => {
                    if let Some(val) = fit_value_to_f64(field.value()) {
                        speed_mps = Some(val);
                    }
                }
                "heading" => heading = fit_value_to_f64(field.value()),
                _ => {}
            }
        }
        if let (Some(ts), Some(lat), Some(lon)) = (timestamp, lat, lon) {
            let mut p = RawPoint::at(ts, GeoPoint::new(lat, lon));
            p.sog_kn = speed_mps.map(mps_to_knots);
            p.heading_deg = heading;
            out.push(p);
        }
    }
    Ok(into_fixes(out))
}

fn fit_value_to_f64(value: &fitparser::Value) -> Option<f64> {
    match value {
        fitparser::Value::Float32(v) => Some(*v as f64),
        fitparser::Value::Float64(v) => Some(*v),
        fitparser::Value::SInt16(v) => Some(*v as f64),
        fitparser::Value::UInt16(v) => Some(*v as f64),
        fitparser::Value::SInt32(v) => Some(*v as f64),
        fitparser::Value::UInt32(v) => Some(*v as f64),
        fitparser::Value::SInt64(v) => Some(*v as f64),
        fitparser::Value::UInt64(v) => Some(*v as f64),
        fitparser::Value::UInt16z(v) => Some(*v as f64),
        fitparser::Value::UInt32z(v) => Some(*v as f64),
        fitparser::Value::UInt8(v) => Some(*v as f64),
        fitparser::Value::SInt8(v) => Some(*v as f64),
        fitparser::Value::Array(values) => values.iter().find_map(fit_value_to_f64),
        _ => None,
    }
}

fn parse_gpx(input: &[u8]) -> Result<Vec<TelemetryFix>, SailError> {
    use gpx::read;
    use std::io::Cursor;

    let gpx = read(&mut Cursor::new(input)).map_err(|e| SailError::GpxParse(e.to_string()))?;
    let mut out = Vec::new();
    for track in gpx.tracks {
        for segment in track.segments {
            for point in segment.points {
                let Some(time) = point.time else { continue };
                let iso = time.format().map_err(|e| SailError::GpxParse(e.to_string()))?;
                let utc = DateTime::parse_from_rfc3339(&iso)
                    .map_err(|e| SailError::GpxParse(e.to_string()))?
                    .with_timezone(&Utc);
                let geo = point.point();
                out.push(RawPoint::at(utc, GeoPoint::new(geo.y(), geo.x())));
            }
        }
    }
    Ok(into_fixes(out))
}

/// Header-named CSV columns; only timestamp and position are required.
#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: DateTime<Utc>,
    lat: f64,
    lon: f64,
    sog_kn: Option<f64>,
    cog_deg: Option<f64>,
    heading_deg: Option<f64>,
    twd_deg: Option<f64>,
    tws_kn: Option<f64>,
    awa_deg: Option<f64>,
    aws_kn: Option<f64>,
}

fn parse_csv(input: &[u8]) -> Result<Vec<TelemetryFix>, SailError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let mut out = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|e| SailError::CsvParse(e.to_string()))?;
        let mut p = RawPoint::at(row.timestamp, GeoPoint::new(row.lat, row.lon));
        p.sog_kn = row.sog_kn;
        p.cog_deg = row.cog_deg;
        p.heading_deg = row.heading_deg;
        p.wind = match (row.twd_deg, row.tws_kn) {
            (Some(direction_deg), Some(speed_kn)) => Some(WindReading {
                direction_deg,
                speed_kn,
            }),
            _ => None,
        };
        p.apparent = match (row.awa_deg, row.aws_kn) {
            (Some(angle_deg), Some(speed_kn)) => Some(ApparentWind { angle_deg, speed_kn }),
            _ => None,
        };
        out.push(p);
    }
    Ok(into_fixes(out))
}
