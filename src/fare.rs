//! Pure fare calculation from trip geometry and duration.

use crate::error::FareError;
use crate::types::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Rate card for fare computation. All rates are settlement units; the
/// defaults are the production constants.
#[derive(Debug, Clone, Copy)]
pub struct FareSchedule {
    pub base: f64,
    pub per_km: f64,
    pub per_min: f64,
    pub surcharge: f64,
}

impl Default for FareSchedule {
    fn default() -> Self {
        Self {
            base: 50.0,
            per_km: 15.0,
            per_min: 2.0,
            surcharge: 10.0,
        }
    }
}

impl FareSchedule {
    /// Compute the settlement amount for a trip. Total over well-formed
    /// coordinates and non-negative durations; a negative duration (end
    /// before start) is rejected rather than clamped or passed through.
    pub fn compute(
        &self,
        pickup: GeoPoint,
        drop_off: GeoPoint,
        duration_min: f64,
    ) -> Result<u64, FareError> {
        if !pickup.is_in_range() {
            return Err(FareError::InvalidInput(format!(
                "pickup coordinate out of range: ({}, {})",
                pickup.lat, pickup.lng
            )));
        }
        if !drop_off.is_in_range() {
            return Err(FareError::InvalidInput(format!(
                "drop coordinate out of range: ({}, {})",
                drop_off.lat, drop_off.lng
            )));
        }
        if !duration_min.is_finite() || duration_min < 0.0 {
            return Err(FareError::InvalidInput(format!(
                "duration must be non-negative, got {duration_min} minutes"
            )));
        }

        let amount = self.base
            + distance_km(pickup, drop_off) * self.per_km
            + duration_min * self.per_min
            + self.surcharge;

        Ok(amount.round() as u64)
    }
}

/// Great-circle distance in kilometres (haversine). Stands in for the
/// external geometry service at this boundary.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_distance_zero_duration_is_base_plus_surcharge() {
        let schedule = FareSchedule::default();
        let point = GeoPoint::new(12.9, 77.6);

        let fare = schedule.compute(point, point, 0.0).unwrap();
        assert_eq!(fare, 60); // base 50 + surcharge 10
    }

    #[test]
    fn negative_duration_is_rejected() {
        let schedule = FareSchedule::default();
        let a = GeoPoint::new(12.9, 77.6);
        let b = GeoPoint::new(13.0, 77.7);

        let err = schedule.compute(a, b, -5.0).unwrap_err();
        assert!(matches!(err, FareError::InvalidInput(_)));
    }

    #[test]
    fn out_of_range_coordinates_are_rejected() {
        let schedule = FareSchedule::default();
        let good = GeoPoint::new(12.9, 77.6);
        let bad = GeoPoint::new(91.0, 77.6);

        assert!(schedule.compute(bad, good, 10.0).is_err());
        assert!(schedule.compute(good, bad, 10.0).is_err());
        assert!(
            schedule
                .compute(GeoPoint::new(f64::NAN, 0.0), good, 10.0)
                .is_err()
        );
    }

    #[test]
    fn haversine_matches_known_distance() {
        // Bangalore city centre to airport vicinity, roughly 15.6 km.
        let a = GeoPoint::new(12.9, 77.6);
        let b = GeoPoint::new(13.0, 77.7);

        let d = distance_km(a, b);
        assert!((d - 15.6).abs() < 0.5, "unexpected distance {d}");
    }
}
