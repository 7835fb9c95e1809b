//! Mode and arming transitions with bounded waits. The caller keeps the
//! setpoint stream running throughout; everything here only watches state
//! and talks to the command services.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::*;

use cs_bridge::{ServiceAck, ServiceRequest, ServiceSink};
use cs_client::CallService;
use cs_telemetry::Telemetry;

use crate::error::CommandError;

const POLL_PERIOD: Duration = Duration::from_millis(100);

/// Puts the vehicle into OFFBOARD and arms it, in that order, skipping
/// whatever already holds.
pub async fn offboard_and_arm(
    services: &ServiceSink,
    telemetry: &watch::Receiver<Telemetry>,
    offboard_timeout: Duration,
    arming_timeout: Duration,
) -> Result<(), CommandError> {
    if !mode_is(telemetry, "OFFBOARD") {
        let start = Utc::now();
        info!("switching to OFFBOARD");
        call(
            services,
            ServiceRequest::SetMode {
                custom_mode: "OFFBOARD".to_owned(),
            },
        )
        .await?;

        wait_for_state(telemetry, offboard_timeout, start, |t| {
            state_mode(t) == Some("OFFBOARD")
        })
        .await
        .map_err(|status| CommandError::OffboardTimeout { status })?;
    }

    if !armed(telemetry) {
        let start = Utc::now();
        info!("arming");
        call(services, ServiceRequest::Arm { value: true }).await?;

        wait_for_state(telemetry, arming_timeout, start, |t| {
            t.state.as_ref().map_or(false, |s| s.armed)
        })
        .await
        .map_err(|status| CommandError::ArmingTimeout { status })?;
    }

    Ok(())
}

/// Requests AUTO.LAND and waits for the mode to take. The request must be
/// acknowledged as sent; the wait then has its own deadline.
pub async fn await_land(
    services: &ServiceSink,
    telemetry: &watch::Receiver<Telemetry>,
    land_timeout: Duration,
) -> Result<(), CommandError> {
    let start = Utc::now();
    info!("landing");

    let ack = call(
        services,
        ServiceRequest::SetMode {
            custom_mode: "AUTO.LAND".to_owned(),
        },
    )
    .await?;
    if !ack.accepted {
        return Err(CommandError::ServiceCallFailed {
            service: "set_mode".to_owned(),
            reason: "mode change request was rejected".to_owned(),
        });
    }

    wait_for_state(telemetry, land_timeout, start, |t| {
        state_mode(t) == Some("AUTO.LAND")
    })
    .await
    .map_err(|status| CommandError::LandTimeout { status })
}

async fn call(services: &ServiceSink, request: ServiceRequest) -> Result<ServiceAck, CommandError> {
    let service = match &request {
        ServiceRequest::Arm { .. } => "arming",
        ServiceRequest::SetMode { .. } => "set_mode",
    };
    services
        .call(request)
        .await
        .map_err(|err| CommandError::ServiceCallFailed {
            service: service.to_owned(),
            reason: err.to_string(),
        })
}

/// Polls until `predicate` holds. On deadline expiry returns the latest
/// autopilot status text, provided it arrived after `start`.
async fn wait_for_state<F>(
    telemetry: &watch::Receiver<Telemetry>,
    timeout: Duration,
    start: DateTime<Utc>,
    predicate: F,
) -> Result<(), Option<String>>
where
    F: Fn(&Telemetry) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate(&telemetry.borrow()) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            let status = telemetry
                .borrow()
                .status
                .as_ref()
                .filter(|s| s.stamp > start)
                .map(|s| s.text.clone());
            return Err(status);
        }
        tokio::time::sleep(POLL_PERIOD).await;
    }
}

fn state_mode(telemetry: &Telemetry) -> Option<&str> {
    telemetry.state.as_ref().map(|s| s.mode.as_str())
}

fn mode_is(telemetry: &watch::Receiver<Telemetry>, mode: &str) -> bool {
    state_mode(&telemetry.borrow()) == Some(mode)
}

fn armed(telemetry: &watch::Receiver<Telemetry>) -> bool {
    telemetry.borrow().state.as_ref().map_or(false, |s| s.armed)
}
