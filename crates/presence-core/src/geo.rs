//! Pure geographic math: distance, bearing, containment, validation.
//!
//! Nothing in this module touches the clock or any I/O. Every function is a
//! deterministic, reentrant function of its inputs.

use crate::models::{Coordinate, Geofence};

/// Mean Earth radius in meters, as used throughout the engine's Haversine math.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance between two points in meters.
///
/// `distance(a, b) == distance(b, a)` and `distance(a, a) == 0.0` for all
/// valid coordinates (P5).
pub fn distance(a: Coordinate, b: Coordinate) -> f64 {
    if a.lat == b.lat && a.lon == b.lon {
        return 0.0;
    }
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dphi = (b.lat - a.lat).to_radians();
    let dlambda = (b.lon - a.lon).to_radians();

    let h = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().clamp(-1.0, 1.0).asin()
}

/// Initial bearing from `a` to `b`, normalized to `[0, 360)` degrees.
pub fn bearing(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dlambda = (b.lon - a.lon).to_radians();

    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    let theta = y.atan2(x).to_degrees();
    (theta + 360.0) % 360.0
}

/// Speed in km/h given a distance in meters and elapsed time in milliseconds.
/// Returns 0 when `dt_ms` is 0 (no elapsed time means no measurable speed).
pub fn speed(distance_m: f64, dt_ms: i64) -> f64 {
    if dt_ms <= 0 {
        return 0.0;
    }
    let hours = dt_ms as f64 / 3_600_000.0;
    (distance_m / 1000.0) / hours
}

/// Range and finiteness check for a coordinate pair.
pub fn valid_coordinate(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

/// Advisory anomaly check: a jump is abnormal only when it covers more than
/// `max_jump_m` over an interval of at least one second. Sub-second jumps of
/// any size are never flagged, since GPS jitter at high sample rates is
/// expected and not evidence of a bad fix.
pub fn abnormal_jump(distance_m: f64, dt_ms: i64, max_jump_m: f64) -> bool {
    if dt_ms < 1000 {
        return false;
    }
    distance_m > max_jump_m
}

/// Closed-disc membership: a point exactly on the boundary is inside (B5).
pub fn point_in_circle(point: Coordinate, center: Coordinate, radius_m: f64) -> bool {
    distance(point, center) <= radius_m
}

/// Ray-casting point-in-polygon test over an implicitly closed ring
/// (vertices need not repeat the first point).
pub fn point_in_polygon(point: Coordinate, vertices: &[Coordinate]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let vi = vertices[i];
        let vj = vertices[j];
        let (yi, xi) = (vi.lat, vi.lon);
        let (yj, xj) = (vj.lat, vj.lon);
        if (yi > point.lat) != (yj > point.lat)
            && point.lon < (xj - xi) * (point.lat - yi) / (yj - yi) + xi
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Dispatches on the geofence tag (P4: a pure function of its inputs).
pub fn point_in_geofence(point: Coordinate, zone: &Geofence) -> bool {
    match zone {
        Geofence::Circular { center, radius_m, .. } => point_in_circle(point, *center, *radius_m),
        Geofence::Polygon { vertices, .. } => point_in_polygon(point, vertices),
    }
}

/// Distance in meters from `point` to the nearest edge of `zone`'s geometry.
/// For a circle this is `|haversine(point, center) - radius|`; for a polygon
/// it is the minimum haversine distance to any edge, with the foot of the
/// perpendicular found by projecting in the flat (lon, lat) plane.
pub fn distance_to_geofence(point: Coordinate, zone: &Geofence) -> f64 {
    match zone {
        Geofence::Circular { center, radius_m, .. } => (distance(point, *center) - radius_m).abs(),
        Geofence::Polygon { vertices, .. } => {
            let n = vertices.len();
            if n < 2 {
                return f64::INFINITY;
            }
            let mut min_dist = f64::INFINITY;
            let mut j = n - 1;
            for i in 0..n {
                let foot = closest_point_on_segment(point, vertices[j], vertices[i]);
                let d = distance(point, foot);
                if d < min_dist {
                    min_dist = d;
                }
                j = i;
            }
            min_dist
        }
    }
}

/// Projects `point` onto the segment `a`-`b` treating (lon, lat) as a flat
/// plane, then returns the corresponding coordinate. Good enough at the
/// scale of a single geofence edge; this is not meant for long segments.
fn closest_point_on_segment(point: Coordinate, a: Coordinate, b: Coordinate) -> Coordinate {
    let (ax, ay) = (a.lon, a.lat);
    let (bx, by) = (b.lon, b.lat);
    let (px, py) = (point.lon, point.lat);

    let dx = bx - ax;
    let dy = by - ay;
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return a;
    }
    let t = (((px - ax) * dx) + ((py - ay) * dy)) / len_sq;
    let t = t.clamp(0.0, 1.0);
    Coordinate { lat: ay + t * dy, lon: ax + t * dx }
}

/// Validates a geofence's own geometry and metadata. Returns the list of
/// errors found; an empty list means the geofence is valid.
pub fn validate_geofence(zone: &Geofence) -> Vec<String> {
    let mut errors = Vec::new();

    if zone.id().trim().is_empty() {
        errors.push("geofence id must not be empty".to_string());
    }
    if zone.name().trim().is_empty() {
        errors.push("geofence name must not be empty".to_string());
    }

    match zone {
        Geofence::Circular { center, radius_m, .. } => {
            if *radius_m <= 0.0 {
                errors.push("circular geofence radius must be > 0".to_string());
            }
            if !valid_coordinate(center.lat, center.lon) {
                errors.push("circular geofence center is not a valid coordinate".to_string());
            }
        }
        Geofence::Polygon { vertices, .. } => {
            if vertices.len() < 3 {
                errors.push("polygon geofence must have at least 3 vertices".to_string());
            }
            if vertices.iter().any(|v| !valid_coordinate(v.lat, v.lon)) {
                errors.push("polygon geofence contains an invalid vertex".to_string());
            }
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(lat: f64, lon: f64) -> Coordinate {
        Coordinate { lat, lon }
    }

    #[test]
    fn distance_is_symmetric_and_zero_for_same_point() {
        let a = c(40.7128, -74.0060);
        let b = c(40.7228, -74.0060);
        assert_eq!(distance(a, a), 0.0);
        assert!((distance(a, b) - distance(b, a)).abs() < 1e-9);
    }

    #[test]
    fn distance_known_value() {
        // One degree of latitude is ~111_194m.
        let dist = distance(c(0.0, 0.0), c(1.0, 0.0));
        assert!((dist - 111_194.0).abs() < 100.0);
    }

    #[test]
    fn bearing_is_normalized() {
        let b = bearing(c(0.0, 0.0), c(0.0, -1.0));
        assert!((0.0..360.0).contains(&b));
    }

    #[test]
    fn speed_zero_when_no_elapsed_time() {
        assert_eq!(speed(500.0, 0), 0.0);
    }

    #[test]
    fn boundary_coordinates_are_valid() {
        assert!(valid_coordinate(90.0, 180.0));
        assert!(valid_coordinate(-90.0, -180.0));
        assert!(!valid_coordinate(91.0, 0.0));
        assert!(!valid_coordinate(0.0, 181.0));
        assert!(!valid_coordinate(f64::NAN, 0.0));
    }

    #[test]
    fn abnormal_jump_ignores_sub_second_intervals() {
        assert!(!abnormal_jump(10_000.0, 500, 300.0));
        assert!(abnormal_jump(10_000.0, 1000, 300.0));
        assert!(!abnormal_jump(100.0, 1000, 300.0));
    }

    #[test]
    fn circle_boundary_and_center_are_inside() {
        let center = c(40.7128, -74.0060);
        assert!(point_in_circle(center, center, 500.0));
        // A point exactly `radius` away (due north, approximately).
        let edge = c(40.7128 + 500.0 / 111_320.0, -74.0060);
        let d = distance(edge, center);
        assert!(point_in_circle(edge, center, d));
    }

    #[test]
    fn polygon_requires_three_vertices() {
        assert!(!point_in_polygon(c(0.0, 0.0), &[c(0.0, 0.0), c(1.0, 0.0)]));
    }

    #[test]
    fn point_in_polygon_is_pure() {
        let square = [c(0.0, 0.0), c(0.0, 1.0), c(1.0, 1.0), c(1.0, 0.0)];
        let inside = point_in_polygon(c(0.5, 0.5), &square);
        let inside_again = point_in_polygon(c(0.5, 0.5), &square);
        assert_eq!(inside, inside_again);
        assert!(inside);
        assert!(!point_in_polygon(c(2.0, 2.0), &square));
    }

    #[test]
    fn validate_geofence_rejects_small_polygon() {
        let zone = Geofence::Polygon {
            id: "z1".into(),
            name: "zone".into(),
            vertices: vec![c(0.0, 0.0), c(1.0, 0.0)],
            metadata: None,
        };
        assert!(!validate_geofence(&zone).is_empty());
    }

    #[test]
    fn validate_geofence_rejects_non_positive_radius() {
        let zone = Geofence::Circular {
            id: "z1".into(),
            name: "zone".into(),
            center: c(0.0, 0.0),
            radius_m: 0.0,
            metadata: None,
        };
        assert!(!validate_geofence(&zone).is_empty());
    }
}
