//! Spherical and planar geometry helpers shared by every stage.

use crate::GeoPoint;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const MPS_PER_KNOT: f64 = 0.514444;
const METERS_PER_DEG_LAT: f64 = 111_320.0;

pub fn knots_to_mps(kn: f64) -> f64 {
    kn * MPS_PER_KNOT
}

pub fn mps_to_knots(mps: f64) -> f64 {
    mps / MPS_PER_KNOT
}

pub fn haversine_distance(a: GeoPoint, b: GeoPoint) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(b.lat - a.lat);
    let dlon = to_rad(b.lon - a.lon);
    let h = (dlat / 2.0).sin().powi(2)
        + to_rad(a.lat).cos() * to_rad(b.lat).cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

/// Initial great-circle bearing from `a` to `b`, degrees true in [0, 360).
pub fn initial_bearing(a: GeoPoint, b: GeoPoint) -> f64 {
    let p1 = a.lat.to_radians();
    let p2 = b.lat.to_radians();
    let dl = (b.lon - a.lon).to_radians();
    let y = dl.sin() * p2.cos();
    let x = p1.cos() * p2.sin() - p1.sin() * p2.cos() * dl.cos();
    norm360(y.atan2(x).to_degrees())
}

/// Local east/north metres relative to a reference point. Accurate to well
/// under a metre over race-course distances.
#[derive(Clone, Copy, Debug)]
pub struct LocalFrame {
    origin: GeoPoint,
    cos_lat: f64,
}

impl LocalFrame {
    pub fn new(origin: GeoPoint) -> Self {
        Self {
            origin,
            cos_lat: origin.lat.to_radians().cos(),
        }
    }

    pub fn to_local(&self, p: GeoPoint) -> (f64, f64) {
        let x = (p.lon - self.origin.lon) * self.cos_lat * METERS_PER_DEG_LAT;
        let y = (p.lat - self.origin.lat) * METERS_PER_DEG_LAT;
        (x, y)
    }
}

/// Unit vector (east, north) for a compass bearing.
pub fn bearing_unit(bearing_deg: f64) -> (f64, f64) {
    let r = bearing_deg.to_radians();
    (r.sin(), r.cos())
}

/// Compass bearing of an (east, north) vector.
pub fn vector_bearing(x: f64, y: f64) -> f64 {
    norm360(x.atan2(y).to_degrees())
}

pub fn norm360(deg: f64) -> f64 {
    let r = deg.rem_euclid(360.0);
    if r >= 360.0 {
        0.0
    } else {
        r
    }
}

/// Normalize to (-180, 180].
pub fn norm180(deg: f64) -> f64 {
    let r = norm360(deg);
    if r > 180.0 {
        r - 360.0
    } else {
        r
    }
}

/// Shortest signed rotation from `from` to `to`, in (-180, 180].
pub fn signed_delta(from: f64, to: f64) -> f64 {
    norm180(to - from)
}

/// Interpolate between two bearings along the shortest arc.
pub fn lerp_angle(a: f64, b: f64, frac: f64) -> f64 {
    norm360(a + signed_delta(a, b) * frac)
}

/// Remove 360° wraps so consecutive values differ by at most 180°.
pub fn unwrap_degrees(values: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut prev: Option<f64> = None;
    for &v in values {
        let next = match prev {
            None => v,
            Some(p) => p + signed_delta(p, v),
        };
        out.push(next);
        prev = Some(next);
    }
    out
}

/// Circular mean of bearings; `None` when the input is empty or the
/// directions cancel out.
pub fn circular_mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (mut s, mut c, mut n) = (0.0, 0.0, 0usize);
    for v in values {
        let r = v.to_radians();
        s += r.sin();
        c += r.cos();
        n += 1;
    }
    if n == 0 || (s.abs() < 1e-12 && c.abs() < 1e-12) {
        return None;
    }
    Some(norm360(s.atan2(c).to_degrees()))
}
