//! Inverse WGS84 geodesic from the current fix to a requested
//! latitude/longitude, decomposed into a planar offset in the local frame.

use std::time::Duration;

use geo::{GeodesicBearing, GeodesicDistance, Point};
use nalgebra::Vector3;

use cs_frames::TransformBuffer;
use cs_types::{GeoFix, StampedPose};

use crate::error::CommandError;

/// Pose in the local frame under the requested coordinates, at the fix's
/// altitude origin (z = 0) with identity orientation.
pub fn global_to_local(
    fix: &GeoFix,
    latitude: f64,
    longitude: f64,
    frames: &TransformBuffer,
    local_frame: &str,
    fcu_frame: &str,
) -> Result<StampedPose, CommandError> {
    let here = Point::new(fix.longitude, fix.latitude);
    let there = Point::new(longitude, latitude);

    let distance = here.geodesic_distance(&there);
    // bearing is degrees clockwise from north
    let azimuth = here.geodesic_bearing(there).to_radians();
    let east = distance * azimuth.sin();
    let north = distance * azimuth.cos();

    let local_fcu = frames.lookup(local_frame, fcu_frame, fix.stamp, Duration::ZERO)?;

    let mut pose = StampedPose::new(local_frame, fix.stamp);
    pose.position = Vector3::new(
        local_fcu.translation.vector.x + east,
        local_fcu.translation.vector.y + north,
        0.0,
    );
    Ok(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion};

    fn fix(latitude: f64, longitude: f64) -> GeoFix {
        GeoFix {
            stamp: Utc::now(),
            latitude,
            longitude,
            altitude: 100.0,
        }
    }

    fn frames_with_fcu_at(x: f64, y: f64) -> TransformBuffer {
        let frames = TransformBuffer::default();
        frames.set_static(
            "map",
            "base_link",
            Isometry3::from_parts(Translation3::new(x, y, 0.0), UnitQuaternion::identity()),
        );
        frames
    }

    #[test]
    fn projecting_the_current_fix_lands_on_the_vehicle() {
        let frames = frames_with_fcu_at(3.0, -2.0);
        let fix = fix(55.7558, 37.6173);

        let pose =
            global_to_local(&fix, 55.7558, 37.6173, &frames, "map", "base_link").unwrap();
        assert_relative_eq!(pose.position.x, 3.0, epsilon = 1e-6);
        assert_relative_eq!(pose.position.y, -2.0, epsilon = 1e-6);
        assert_relative_eq!(pose.position.z, 0.0);
    }

    #[test]
    fn a_longitude_step_maps_eastward() {
        let frames = frames_with_fcu_at(0.0, 0.0);
        let fix = fix(55.7558, 37.6173);

        let pose =
            global_to_local(&fix, 55.7558, 37.6183, &frames, "map", "base_link").unwrap();
        // ~62.8 m per 0.001 degree of longitude at this latitude
        assert_relative_eq!(pose.position.x, 62.8, epsilon = 0.3);
        assert!(pose.position.y.abs() < 0.1);
    }

    #[test]
    fn a_latitude_step_maps_northward() {
        let frames = frames_with_fcu_at(0.0, 0.0);
        let fix = fix(55.7558, 37.6173);

        let pose =
            global_to_local(&fix, 55.7568, 37.6173, &frames, "map", "base_link").unwrap();
        assert!(pose.position.x.abs() < 0.1);
        assert_relative_eq!(pose.position.y, 111.4, epsilon = 0.5);
    }

    #[test]
    fn missing_fcu_transform_is_reported() {
        let frames = TransformBuffer::default();
        let err = global_to_local(&fix(0.0, 0.0), 0.0, 0.0, &frames, "map", "base_link")
            .unwrap_err();
        assert!(matches!(err, CommandError::TransformUnavailable { .. }));
    }
}
