//! Great-circle proximity checks on a spherical-earth approximation.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// A geolocation fix as reported by the scanning device. The accuracy is
/// carried for the record but never alters the geofence threshold; the check
/// stays deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedLocation {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
}

impl ReportedLocation {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            lat: self.lat,
            lng: self.lng,
        }
    }
}

/// Circular region a reported location must fall within.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    pub center: GeoPoint,
    pub radius_m: f64,
}

impl Geofence {
    pub fn distance_to(&self, point: GeoPoint) -> f64 {
        distance_meters(self.center, point)
    }

    /// Inclusive: a point exactly on the boundary is inside.
    pub fn contains(&self, point: GeoPoint) -> bool {
        self.distance_to(point) <= self.radius_m
    }
}

/// Haversine distance between two coordinates, in meters.
pub fn distance_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}
