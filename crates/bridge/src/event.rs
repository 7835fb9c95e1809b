use nalgebra::Vector3;

use cs_types::{AutopilotState, BatteryReading, GeoFix, StampedPose, StampedVector, StatusText};

/// Telemetry decoded from the autopilot stream. Every variant carries its
/// own stamp; consumers keep only the most recent value per variant.
#[derive(Debug, Clone)]
pub enum AutopilotEvent {
    State(AutopilotState),
    LocalPose(StampedPose),
    Velocity {
        linear: StampedVector,
        /// Body-frame angular rates (roll, pitch, yaw), rad/s.
        angular: Vector3<f64>,
    },
    GlobalFix(GeoFix),
    Battery(BatteryReading),
    Status(StatusText),
}
