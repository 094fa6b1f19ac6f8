//! Turns a single distance and angle-of-arrival measurement into a point in
//! the radio's own frame of reference.
//!
//! The x axis points straight out of the antenna array, y to the left and z
//! up. Each measurement is converted on its own; nothing here fuses results
//! across nodes.

use crate::notification_decoder::RangeMeasurement;
use crate::smoother::SmoothedMeasurement;

use std::fmt::{self, Display};

/// A position in meters.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Point {
    /// Forward
    pub x: f64,
    /// Left
    pub y: f64,
    /// Up
    pub z: f64,
}

impl Point {
    /// Straight line distance from the origin.
    pub fn norm(&self) -> f64 {
        (self.x.powi(2) + self.y.powi(2) + self.z.powi(2)).sqrt()
    }
}

impl Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// Spherical to Cartesian, with the range in meters and both angles in
/// degrees.
pub fn spherical_to_cartesian(range_m: f64, azimuth_deg: f64, elevation_deg: f64) -> Point {
    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();
    Point {
        x: range_m * el.cos() * az.cos(),
        y: range_m * el.cos() * az.sin(),
        z: range_m * el.sin(),
    }
}

/// Where a measurement puts the other board.
pub fn to_cartesian(measurement: &RangeMeasurement) -> Point {
    spherical_to_cartesian(
        measurement.distance_cm as f64 / 100.0,
        measurement.azimuth_deg,
        measurement.elevation_deg,
    )
}

/// Same as [to_cartesian], for the moving averages. `None` until the
/// distance and angle windows all hold something.
pub fn smoothed_to_cartesian(smoothed: &SmoothedMeasurement) -> Option<Point> {
    let fields = [
        smoothed.distance_cm,
        smoothed.azimuth_deg,
        smoothed.elevation_deg,
    ];
    if fields.iter().any(|v| v.is_nan()) {
        return None;
    }
    Some(spherical_to_cartesian(
        smoothed.distance_cm / 100.0,
        smoothed.azimuth_deg,
        smoothed.elevation_deg,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn at(distance_cm: u16, azimuth_deg: f64, elevation_deg: f64) -> RangeMeasurement {
        RangeMeasurement {
            sequence: 0,
            status: 0,
            nlos: false,
            distance_cm,
            azimuth_deg,
            azimuth_fom: 100,
            elevation_deg,
            elevation_fom: 100,
            pdoa1_deg: None,
            pdoa2_deg: None,
        }
    }

    #[test]
    fn straight_ahead() {
        let p = to_cartesian(&at(250, 0.0, 0.0));
        assert!((p.x - 2.5).abs() < EPS);
        assert!(p.y.abs() < EPS);
        assert!(p.z.abs() < EPS);
    }

    #[test]
    fn quarter_turns() {
        let left = to_cartesian(&at(100, 90.0, 0.0));
        assert!(left.x.abs() < EPS && (left.y - 1.0).abs() < EPS);

        let up = to_cartesian(&at(100, 45.0, 90.0));
        assert!((up.z - 1.0).abs() < EPS);
        assert!(up.x.abs() < EPS && up.y.abs() < EPS);
    }

    #[test]
    fn keeps_the_range() {
        let p = to_cartesian(&at(731, -37.4, 12.9));
        assert!((p.norm() - 7.31).abs() < EPS);
    }

    #[test]
    fn smoothed_needs_all_windows() {
        let mut smoothed = SmoothedMeasurement {
            distance_cm: 200.0,
            azimuth_deg: 0.0,
            elevation_deg: f64::NAN,
            pdoa1_deg: f64::NAN,
            pdoa2_deg: f64::NAN,
        };
        assert_eq!(smoothed_to_cartesian(&smoothed), None);

        smoothed.elevation_deg = 0.0;
        let p = smoothed_to_cartesian(&smoothed).unwrap();
        assert!((p.x - 2.0).abs() < EPS);
    }
}
