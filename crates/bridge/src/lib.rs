//! Link to the flight controller: telemetry decode, setpoint encode, and
//! the arming / mode-change services, all over one MAVLink v2 endpoint.

use std::net::SocketAddr;

use serde::Deserialize;

mod convert;
mod event;
mod interface;
mod px4;
mod setpoint;
mod task;

pub use event::AutopilotEvent;
pub use setpoint::{
    AttitudeTarget, PositionTarget, SetpointMessage, ThrustSetpoint,
};
pub use task::{create_task, BridgeTask};

// re-exported so downstream code can compose IGNORE bits
pub use mavlink::common::{AttitudeTargetTypemask, PositionTargetTypemask};

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Local UDP endpoint the autopilot (or its proxy) talks to.
    pub address: SocketAddr,

    /// Seconds to wait for a COMMAND_ACK before a service call fails.
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout: f64,
}

fn default_ack_timeout() -> f64 {
    5.0
}

/// Calls accepted by the autopilot's command services.
#[derive(Debug, Clone)]
pub enum ServiceRequest {
    Arm { value: bool },
    SetMode { custom_mode: String },
}

/// Acknowledgement from the autopilot. `accepted` mirrors the result code;
/// a refused command still acknowledges.
#[derive(Debug, Clone, Copy)]
pub struct ServiceAck {
    pub accepted: bool,
}

pub type ServiceSink = cs_client::ServiceSink<ServiceRequest, ServiceAck>;
