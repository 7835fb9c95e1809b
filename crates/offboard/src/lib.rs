//! High-level OFFBOARD control: a command arbiter that turns discrete
//! requests into a continuously published stream of autopilot setpoints.

mod command;
mod config;
mod control;
mod error;
mod geodesic;
mod publisher;
mod sequencer;
mod setpoint;

pub use command::{
    Ack, ApiRequest, ApiResponse, GetTelemetryRequest, NavigateGlobalRequest, NavigateRequest,
    SetAttitudeRequest, SetPositionRequest, SetRatesRequest, SetVelocityRequest,
    TelemetrySnapshot,
};
pub use config::OffboardConfig;
pub use control::{create_task as create_control_task, CommandSink, ControlTask};
pub use error::CommandError;
pub use publisher::{create_task as create_publisher_task, Pipeline, PublisherTask};
pub use setpoint::{ActiveSetpoint, Commanded, NavigateGoal, SetpointHandle, YawPolicy};
