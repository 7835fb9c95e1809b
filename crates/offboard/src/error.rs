use thiserror::Error;

/// Everything a command can fail with. The display string is the message
/// handed back to the client; no variant ever aborts the process.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Busy")]
    Busy,

    #[error("State timeout, check autopilot connection")]
    StateStale,

    #[error("No connection to autopilot")]
    NotConnected,

    #[error("{0}")]
    BadArgument(String),

    #[error("No local position")]
    NoLocalPosition,

    #[error("No global position")]
    NoGlobalFix,

    #[error("can't transform from {from_frame} to {target}")]
    TransformUnavailable { target: String, from_frame: String },

    #[error("error calling {service} service: {reason}")]
    ServiceCallFailed { service: String, reason: String },

    #[error("OFFBOARD timed out{}", suffix(.status))]
    OffboardTimeout { status: Option<String> },

    #[error("Arming timed out{}", suffix(.status))]
    ArmingTimeout { status: Option<String> },

    #[error("Land request timed out{}", suffix(.status))]
    LandTimeout { status: Option<String> },

    #[error("Copter is not in OFFBOARD mode, use auto_arm?")]
    NotOffboard,

    #[error("Copter is not armed, use auto_arm?")]
    NotArmed,
}

fn suffix(status: &Option<String>) -> String {
    match status {
        Some(text) => format!(": {}", text),
        None => String::new(),
    }
}

impl From<cs_frames::TransformError> for CommandError {
    fn from(err: cs_frames::TransformError) -> Self {
        let cs_frames::TransformError::Unavailable { target, from_frame } = err;
        CommandError::TransformUnavailable { target, from_frame }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages_append_status_text() {
        let plain = CommandError::OffboardTimeout { status: None };
        assert_eq!(plain.to_string(), "OFFBOARD timed out");

        let with_status = CommandError::ArmingTimeout {
            status: Some("Arming denied: no GPS".to_owned()),
        };
        assert_eq!(
            with_status.to_string(),
            "Arming timed out: Arming denied: no GPS"
        );
    }

    #[test]
    fn transform_errors_carry_the_frames() {
        let err: CommandError = cs_frames::TransformError::Unavailable {
            target: "map".to_owned(),
            from_frame: "body".to_owned(),
        }
        .into();
        assert_eq!(err.to_string(), "can't transform from body to map");
    }
}
