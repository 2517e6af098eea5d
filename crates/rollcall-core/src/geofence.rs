//! Geofence validation: great-circle distance for circular fences and
//! point-in-polygon for polygonal ones.

use crate::types::{Coordinate, Geofence, LatLon};
use thiserror::Error;

/// Mean Earth radius used by the haversine formula.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Reasons a GPS fix is unusable. Every fault is a hard reject.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpsFault {
    #[error("coordinate is not finite")]
    NonFinite,
    #[error("coordinate out of range: lat={lat} lon={lon}")]
    OutOfRange { lat: f64, lon: f64 },
    #[error("coordinate is exactly (0, 0); treated as a missing fix")]
    NullIsland,
    #[error("fix accuracy {accuracy_m}m is worse than the allowed {max_m}m")]
    PoorAccuracy { accuracy_m: f64, max_m: f64 },
}

/// Great-circle distance in meters.
pub fn haversine_m(a: LatLon, b: LatLon) -> f64 {
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();
    let h = (dlat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

impl Geofence {
    /// Inclusive containment: a point exactly on the boundary is inside.
    pub fn contains(&self, p: LatLon) -> bool {
        match self {
            Geofence::Circle { center, radius_m } => haversine_m(*center, p) <= *radius_m,
            Geofence::Polygon { vertices } => polygon_contains(vertices, p),
        }
    }

    /// Distance to the fence center, for circular fences.
    pub fn distance_to_center_m(&self, p: LatLon) -> Option<f64> {
        match self {
            Geofence::Circle { center, .. } => Some(haversine_m(*center, p)),
            Geofence::Polygon { .. } => None,
        }
    }
}

/// Even-odd ray cast in the lon/lat plane, with edges counted as inside.
fn polygon_contains(vertices: &[LatLon], p: LatLon) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (a, b) = (vertices[i], vertices[j]);
        if on_segment(a, b, p) {
            return true;
        }
        if (a.lat > p.lat) != (b.lat > p.lat) {
            let x = (b.lon - a.lon) * (p.lat - a.lat) / (b.lat - a.lat) + a.lon;
            if p.lon < x {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: LatLon, b: LatLon, p: LatLon) -> bool {
    let cross = (b.lon - a.lon) * (p.lat - a.lat) - (b.lat - a.lat) * (p.lon - a.lon);
    if cross.abs() > 1e-12 {
        return false;
    }
    p.lon >= a.lon.min(b.lon)
        && p.lon <= a.lon.max(b.lon)
        && p.lat >= a.lat.min(b.lat)
        && p.lat <= a.lat.max(b.lat)
}

/// Validates GPS fixes against a user's geofence.
#[derive(Debug, Clone, Copy)]
pub struct GeofenceValidator {
    max_accuracy_m: f64,
}

impl GeofenceValidator {
    pub fn new(max_accuracy_m: f64) -> Self {
        Self { max_accuracy_m }
    }

    /// Reject fixes that cannot be trusted at all.
    pub fn check_fix(&self, c: &Coordinate) -> Result<(), GpsFault> {
        if !c.lat.is_finite() || !c.lon.is_finite() || !c.accuracy_m.is_finite() {
            return Err(GpsFault::NonFinite);
        }
        if !(-90.0..=90.0).contains(&c.lat) || !(-180.0..=180.0).contains(&c.lon) {
            return Err(GpsFault::OutOfRange { lat: c.lat, lon: c.lon });
        }
        if c.lat == 0.0 && c.lon == 0.0 {
            return Err(GpsFault::NullIsland);
        }
        if c.accuracy_m < 0.0 || c.accuracy_m > self.max_accuracy_m {
            return Err(GpsFault::PoorAccuracy {
                accuracy_m: c.accuracy_m,
                max_m: self.max_accuracy_m,
            });
        }
        Ok(())
    }

    pub fn validate(&self, c: &Coordinate, fence: &Geofence) -> bool {
        match self.check_fix(c) {
            Ok(()) => fence.contains(c.point()),
            Err(fault) => {
                tracing::debug!(%fault, "gps fix rejected");
                false
            }
        }
    }
}
