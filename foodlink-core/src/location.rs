use serde::{Deserialize, Serialize};

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance (haversine).
    pub fn distance_km(&self, other: &GeoPoint) -> f64 {
        let d_lat = (other.lat - self.lat).to_radians();
        let d_lon = (other.lon - self.lon).to_radians();
        let a = (d_lat / 2.0).sin().powi(2)
            + self.lat.to_radians().cos() * other.lat.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

/// A display label plus optional coordinates, as handed over by the mapping service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub label: String,
    pub point: Option<GeoPoint>,
}

impl Location {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            point: None,
        }
    }

    pub fn with_point(label: impl Into<String>, lat: f64, lon: f64) -> Self {
        Self {
            label: label.into(),
            point: Some(GeoPoint::new(lat, lon)),
        }
    }

    /// Distance when both sides have coordinates.
    pub fn distance_km(&self, other: &Location) -> Option<f64> {
        match (&self.point, &other.point) {
            (Some(a), Some(b)) => Some(a.distance_km(b)),
            _ => None,
        }
    }

    pub fn same_label(&self, other: &Location) -> bool {
        self.label.trim().eq_ignore_ascii_case(other.label.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_between_known_points() {
        // Mumbai CST to Pune station, roughly 120 km apart
        let mumbai = GeoPoint::new(18.9398, 72.8355);
        let pune = GeoPoint::new(18.5286, 73.8743);
        let km = mumbai.distance_km(&pune);
        assert!(km > 110.0 && km < 125.0, "got {}", km);
        assert_eq!(mumbai.distance_km(&mumbai), 0.0);
    }

    #[test]
    fn test_distance_needs_both_points() {
        let a = Location::with_point("Depot", 12.97, 77.59);
        let b = Location::new("depot ");
        assert!(a.distance_km(&b).is_none());
        assert!(a.same_label(&b));
    }
}
