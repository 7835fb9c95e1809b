//! The client surface. Requests arrive over any transport that can build
//! these types; every command answers with `success` + `message`, and
//! `get_telemetry` answers with a snapshot.

use cs_serde_util::{deserialize_wire_f32, nan, serialize_wire_f32};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateRequest {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default = "nan", deserialize_with = "deserialize_wire_f32")]
    pub yaw: f32,
    #[serde(default, deserialize_with = "deserialize_wire_f32")]
    pub yaw_rate: f32,
    #[serde(default)]
    pub speed: f32,
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NavigateGlobalRequest {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub z: f32,
    #[serde(default = "nan", deserialize_with = "deserialize_wire_f32")]
    pub yaw: f32,
    #[serde(default, deserialize_with = "deserialize_wire_f32")]
    pub yaw_rate: f32,
    #[serde(default)]
    pub speed: f32,
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetPositionRequest {
    #[serde(default)]
    pub x: f32,
    #[serde(default)]
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default = "nan", deserialize_with = "deserialize_wire_f32")]
    pub yaw: f32,
    #[serde(default, deserialize_with = "deserialize_wire_f32")]
    pub yaw_rate: f32,
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetVelocityRequest {
    #[serde(default)]
    pub vx: f32,
    #[serde(default)]
    pub vy: f32,
    #[serde(default)]
    pub vz: f32,
    #[serde(default = "nan", deserialize_with = "deserialize_wire_f32")]
    pub yaw: f32,
    #[serde(default, deserialize_with = "deserialize_wire_f32")]
    pub yaw_rate: f32,
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetAttitudeRequest {
    #[serde(default)]
    pub roll: f32,
    #[serde(default)]
    pub pitch: f32,
    #[serde(default = "nan", deserialize_with = "deserialize_wire_f32")]
    pub yaw: f32,
    #[serde(default)]
    pub thrust: f32,
    #[serde(default)]
    pub frame_id: String,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetRatesRequest {
    #[serde(default)]
    pub roll_rate: f32,
    #[serde(default)]
    pub pitch_rate: f32,
    #[serde(default)]
    pub yaw_rate: f32,
    #[serde(default)]
    pub thrust: f32,
    #[serde(default)]
    pub auto_arm: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetTelemetryRequest {
    #[serde(default)]
    pub frame_id: String,
}

#[derive(Debug, Clone)]
pub enum ApiRequest {
    Navigate(NavigateRequest),
    NavigateGlobal(NavigateGlobalRequest),
    SetPosition(SetPositionRequest),
    SetVelocity(SetVelocityRequest),
    SetAttitude(SetAttitudeRequest),
    SetRates(SetRatesRequest),
    Land,
    GetTelemetry(GetTelemetryRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// Flat snapshot answered by `get_telemetry`. Unavailable readings stay
/// NaN and serialize as null.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub frame_id: String,
    pub connected: bool,
    pub armed: bool,
    pub mode: String,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub x: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub y: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub z: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub lat: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub lon: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub alt: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub vx: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub vy: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub vz: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub roll: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub pitch: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub yaw: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub roll_rate: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub pitch_rate: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub yaw_rate: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub voltage: f32,
    #[serde(serialize_with = "serialize_wire_f32")]
    pub cell_voltage: f32,
}

impl TelemetrySnapshot {
    pub fn empty(frame_id: String) -> Self {
        TelemetrySnapshot {
            frame_id,
            connected: false,
            armed: false,
            mode: String::new(),
            x: f32::NAN,
            y: f32::NAN,
            z: f32::NAN,
            lat: f32::NAN,
            lon: f32::NAN,
            alt: f32::NAN,
            vx: f32::NAN,
            vy: f32::NAN,
            vz: f32::NAN,
            roll: f32::NAN,
            pitch: f32::NAN,
            yaw: f32::NAN,
            roll_rate: f32::NAN,
            pitch_rate: f32::NAN,
            yaw_rate: f32::NAN,
            voltage: f32::NAN,
            cell_voltage: f32::NAN,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ApiResponse {
    Ack(Ack),
    Telemetry(TelemetrySnapshot),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omitted_yaw_selects_yaw_rate_mode_input() {
        let req: SetPositionRequest =
            serde_json::from_str(r#"{"x": 1, "y": 2, "z": 3, "yaw_rate": 0.5}"#).unwrap();
        assert!(req.yaw.is_nan());
        assert_eq!(req.yaw_rate, 0.5);
        assert!(req.frame_id.is_empty());
    }

    #[test]
    fn infinite_yaw_survives_the_wire() {
        let req: NavigateRequest =
            serde_json::from_str(r#"{"x": 1, "yaw": "inf", "speed": 0.8}"#).unwrap();
        assert!(req.yaw.is_infinite() && req.yaw > 0.0);
    }

    #[test]
    fn snapshot_reports_missing_readings_as_null() {
        let snapshot = TelemetrySnapshot::empty("map".to_owned());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["x"].is_null());
        assert_eq!(json["connected"], serde_json::json!(false));
    }
}
