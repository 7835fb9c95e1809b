use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OffboardConfig {
    /// The autopilot's local frame; commands with an empty frame_id resolve
    /// here.
    #[serde(default = "default_local_frame")]
    pub local_frame: String,

    /// Flight-controller-fixed frame, used by the geodesic projection.
    #[serde(default = "default_fcu_frame")]
    pub fcu_frame: String,

    /// Name the current position goal is broadcast under; empty disables.
    #[serde(default = "default_target_frame")]
    pub target_frame: String,

    /// Reserved.
    #[serde(default = "default_true")]
    pub auto_release: bool,

    #[serde(default = "default_true")]
    pub land_only_in_offboard: bool,

    /// Navigation speed substituted when a request passes 0.
    #[serde(default = "default_speed")]
    pub default_speed: f32,

    /// Aliases from a requested frame name to the frame actually used for
    /// setpoint storage.
    #[serde(default)]
    pub reference_frames: HashMap<String, String>,

    /// Publisher tick rate, Hz.
    #[serde(default = "default_setpoint_rate")]
    pub setpoint_rate: f64,

    #[serde(default = "default_transform_timeout")]
    pub transform_timeout: f64,
    #[serde(default = "default_transform_timeout")]
    pub telemetry_transform_timeout: f64,
    #[serde(default = "default_offboard_timeout")]
    pub offboard_timeout: f64,
    #[serde(default = "default_land_timeout")]
    pub land_timeout: f64,
    #[serde(default = "default_arming_timeout")]
    pub arming_timeout: f64,
}

impl Default for OffboardConfig {
    fn default() -> Self {
        OffboardConfig {
            local_frame: default_local_frame(),
            fcu_frame: default_fcu_frame(),
            target_frame: default_target_frame(),
            auto_release: true,
            land_only_in_offboard: true,
            default_speed: default_speed(),
            reference_frames: HashMap::new(),
            setpoint_rate: default_setpoint_rate(),
            transform_timeout: default_transform_timeout(),
            telemetry_transform_timeout: default_transform_timeout(),
            offboard_timeout: default_offboard_timeout(),
            land_timeout: default_land_timeout(),
            arming_timeout: default_arming_timeout(),
        }
    }
}

impl OffboardConfig {
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.transform_timeout)
    }

    pub fn telemetry_transform_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.telemetry_transform_timeout)
    }

    pub fn offboard_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.offboard_timeout)
    }

    pub fn land_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.land_timeout)
    }

    pub fn arming_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.arming_timeout)
    }
}

fn default_local_frame() -> String {
    "map".to_owned()
}

fn default_fcu_frame() -> String {
    "base_link".to_owned()
}

fn default_target_frame() -> String {
    "navigate_target".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_speed() -> f32 {
    0.5
}

fn default_setpoint_rate() -> f64 {
    30.0
}

fn default_transform_timeout() -> f64 {
    0.5
}

fn default_offboard_timeout() -> f64 {
    3.0
}

fn default_land_timeout() -> f64 {
    3.0
}

fn default_arming_timeout() -> f64 {
    4.0
}
