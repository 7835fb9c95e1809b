use chrono::{DateTime, Utc};
use nalgebra::Vector3;

use cs_types::StampedPose;
use mavlink::common::{AttitudeTargetTypemask, PositionTargetTypemask};

/// Raw local-frame target with explicit IGNORE bits.
#[derive(Debug, Clone)]
pub struct PositionTarget {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub type_mask: PositionTargetTypemask,
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub yaw: f32,
    pub yaw_rate: f32,
}

/// Raw attitude target; with ATTITUDE_IGNORE set only the body rates and
/// thrust are commanded.
#[derive(Debug, Clone)]
pub struct AttitudeTarget {
    pub stamp: DateTime<Utc>,
    pub frame_id: String,
    pub type_mask: AttitudeTargetTypemask,
    /// Body-frame angular rates (roll, pitch, yaw), rad/s.
    pub body_rate: Vector3<f64>,
    pub thrust: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct ThrustSetpoint {
    pub stamp: DateTime<Utc>,
    pub thrust: f32,
}

/// One outgoing low-level setpoint. Variants correspond to the distinct
/// channels the autopilot accepts targets on.
#[derive(Debug, Clone)]
pub enum SetpointMessage {
    /// Position + absolute yaw.
    Pose(StampedPose),
    /// Position or velocity with explicit IGNORE bits.
    PositionRaw(PositionTarget),
    /// Attitude to hold; thrust arrives on its own channel.
    AttitudePose(StampedPose),
    Thrust(ThrustSetpoint),
    /// Body rates (attitude ignored).
    AttitudeRaw(AttitudeTarget),
}
