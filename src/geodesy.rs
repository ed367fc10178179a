//! Local-tangent offsets and ground distances
//!
//! Offsets use a flat-earth approximation around the aircraft position, which
//! is accurate to centimeters over the few hundred meters a camera footprint
//! spans. Distances between records use the haversine great-circle formula.

use geo::{HaversineDistance, Point};

/// Meters per degree of latitude.
pub const METERS_PER_DEGREE_LAT: f64 = 110_540.0;

/// Meters per degree of longitude at the equator; scaled by cos(lat) elsewhere.
pub const METERS_PER_DEGREE_LON_EQUATOR: f64 = 111_320.0;

/// Convert an (east, north) offset in meters to a (Δlat, Δlon) delta in degrees.
pub fn offset_to_delta(east_m: f64, north_m: f64, origin_lat: f64) -> (f64, f64) {
    let d_lat = north_m / METERS_PER_DEGREE_LAT;
    let d_lon = east_m / (METERS_PER_DEGREE_LON_EQUATOR * origin_lat.to_radians().cos());
    (d_lat, d_lon)
}

/// Inverse of [`offset_to_delta`].
pub fn delta_to_offset(d_lat: f64, d_lon: f64, origin_lat: f64) -> (f64, f64) {
    let north = d_lat * METERS_PER_DEGREE_LAT;
    let east = d_lon * METERS_PER_DEGREE_LON_EQUATOR * origin_lat.to_radians().cos();
    (east, north)
}

/// Apply an (east, north) meter offset to an origin, returning (lat, lon).
pub fn offset_latlon(origin_lat: f64, origin_lon: f64, east_m: f64, north_m: f64) -> (f64, f64) {
    let (d_lat, d_lon) = offset_to_delta(east_m, north_m, origin_lat);
    (origin_lat + d_lat, origin_lon + d_lon)
}

/// Great-circle ground distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    Point::new(lon1, lat1).haversine_distance(&Point::new(lon2, lat2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_offset_round_trip_across_latitudes() {
        let offsets = [(0.0, 0.0), (12.5, -7.25), (-250.0, 310.0), (999.0, 0.5)];
        let mut lat = -80.0;
        while lat <= 80.0 {
            for &(east, north) in &offsets {
                let (d_lat, d_lon) = offset_to_delta(east, north, lat);
                let (east_back, north_back) = delta_to_offset(d_lat, d_lon, lat);
                assert_abs_diff_eq!(east_back, east, epsilon = 0.01);
                assert_abs_diff_eq!(north_back, north, epsilon = 0.01);
            }
            lat += 10.0;
        }
    }

    #[test]
    fn test_north_offset_moves_latitude_only() {
        let (lat, lon) = offset_latlon(22.78, 114.1, 0.0, 110.54);
        assert_abs_diff_eq!(lat, 22.781, epsilon = 1e-9);
        assert_eq!(lon, 114.1);
    }

    #[test]
    fn test_haversine_short_distance() {
        // ~1 m north
        let d = haversine_m(22.78, 114.1, 22.78 + 1.0 / 111_195.0, 114.1);
        assert_abs_diff_eq!(d, 1.0, epsilon = 0.01);
        assert_eq!(haversine_m(22.78, 114.1, 22.78, 114.1), 0.0);
    }
}
