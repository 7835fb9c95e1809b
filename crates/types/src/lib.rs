use chrono::{DateTime, Utc};
use nalgebra::{UnitQuaternion, Vector3};

/// A pose (position + orientation) expressed in a named frame at a point
/// in time.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedPose {
    pub frame_id: String,
    pub stamp: DateTime<Utc>,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl StampedPose {
    pub fn new(frame_id: impl Into<String>, stamp: DateTime<Utc>) -> Self {
        StampedPose {
            frame_id: frame_id.into(),
            stamp,
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
        }
    }

    pub fn yaw(&self) -> f64 {
        yaw_of(&self.orientation)
    }
}

/// A free 3-vector (velocity, offset) expressed in a named frame at a point
/// in time.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedVector {
    pub frame_id: String,
    pub stamp: DateTime<Utc>,
    pub vector: Vector3<f64>,
}

/// Most recent global position fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoFix {
    pub stamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// Connection/arming/mode summary reported by the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub struct AutopilotState {
    pub stamp: DateTime<Utc>,
    pub connected: bool,
    pub armed: bool,
    pub mode: String,
}

/// Free-form status line forwarded by the autopilot.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusText {
    pub stamp: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatteryReading {
    pub stamp: DateTime<Utc>,
    pub voltage: f32,
    /// Voltage of the first cell, when per-cell readings are available.
    pub cell_voltage: Option<f32>,
}

/// Quaternion from Tait-Bryan angles, z-y-x order.
pub fn quat_from_rpy(roll: f64, pitch: f64, yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}

/// Rotation about the vertical axis only.
pub fn yaw_quat(yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(0.0, 0.0, yaw)
}

/// Yaw component of an orientation, Tait-Bryan z-y-x.
pub fn yaw_of(q: &UnitQuaternion<f64>) -> f64 {
    q.euler_angles().2
}
