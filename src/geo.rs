const EARTH_RADIUS_MILES: f64 = 3959.87433;

/// Haversine great-circle distance between two GPS coordinates, in miles.
pub fn distance_miles(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_MILES * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn same_point_is_zero() {
        assert_eq!(distance_miles(41.8781, -87.6298, 41.8781, -87.6298), 0.0);
    }

    #[test]
    fn symmetric() {
        let a = distance_miles(41.8781, -87.6298, 41.9484, -87.6553);
        let b = distance_miles(41.9484, -87.6553, 41.8781, -87.6298);
        assert_relative_eq!(a, b, epsilon = 1e-12);
    }

    #[test]
    fn known_distance() {
        // Willis Tower to Wrigley Field, roughly 5 miles
        let d = distance_miles(41.8789, -87.6359, 41.9484, -87.6553);
        assert_relative_eq!(d, 4.9, epsilon = 0.2);
    }
}
