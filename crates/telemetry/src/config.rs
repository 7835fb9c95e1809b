use serde::Deserialize;

/// Freshness budgets (seconds) for each cached stream, plus the name the
/// vehicle body frame is republished under.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_state_timeout")]
    pub state_timeout: f64,
    #[serde(default = "default_local_position_timeout")]
    pub local_position_timeout: f64,
    #[serde(default = "default_velocity_timeout")]
    pub velocity_timeout: f64,
    #[serde(default = "default_global_position_timeout")]
    pub global_position_timeout: f64,
    #[serde(default = "default_battery_timeout")]
    pub battery_timeout: f64,

    /// Empty disables the body-frame broadcast.
    #[serde(default = "default_body_frame")]
    pub body_frame: String,

    /// Frame tracking the flight controller with its full orientation.
    #[serde(default = "default_fcu_frame")]
    pub fcu_frame: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            state_timeout: default_state_timeout(),
            local_position_timeout: default_local_position_timeout(),
            velocity_timeout: default_velocity_timeout(),
            global_position_timeout: default_global_position_timeout(),
            battery_timeout: default_battery_timeout(),
            body_frame: default_body_frame(),
            fcu_frame: default_fcu_frame(),
        }
    }
}

fn default_state_timeout() -> f64 {
    3.0
}

fn default_local_position_timeout() -> f64 {
    2.0
}

fn default_velocity_timeout() -> f64 {
    2.0
}

fn default_global_position_timeout() -> f64 {
    10.0
}

fn default_battery_timeout() -> f64 {
    2.0
}

fn default_body_frame() -> String {
    "body".to_owned()
}

fn default_fcu_frame() -> String {
    "base_link".to_owned()
}
