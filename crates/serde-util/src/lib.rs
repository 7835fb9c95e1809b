use serde::{Deserialize, Deserializer, Serializer};

// JSON has no representation for NaN or infinity, but both are meaningful
// command inputs (NaN selects yaw-rate mode, +inf selects travel-direction
// yaw). On the wire a float is a number, null (NaN), or one of the strings
// "nan" / "inf" / "-inf". A missing field behaves like null.

pub fn nan() -> f32 {
    f32::NAN
}

pub fn deserialize_wire_f32<'de, D>(deserializer: D) -> Result<f32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Num(f64),
        Text(String),
    }

    match Option::<Wire>::deserialize(deserializer)? {
        None => Ok(f32::NAN),
        Some(Wire::Num(v)) => Ok(v as f32),
        Some(Wire::Text(t)) => match t.trim().to_ascii_lowercase().as_str() {
            "nan" => Ok(f32::NAN),
            "inf" | "+inf" | "infinity" => Ok(f32::INFINITY),
            "-inf" | "-infinity" => Ok(f32::NEG_INFINITY),
            other => Err(serde::de::Error::custom(format!(
                "not a float: {:?}",
                other
            ))),
        },
    }
}

pub fn serialize_wire_f32<S>(value: &f32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.is_nan() {
        serializer.serialize_none()
    } else if value.is_infinite() {
        serializer.serialize_str(if *value > 0.0 { "inf" } else { "-inf" })
    } else {
        serializer.serialize_f32(*value)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Sample {
        #[serde(
            default = "crate::nan",
            deserialize_with = "crate::deserialize_wire_f32",
            serialize_with = "crate::serialize_wire_f32"
        )]
        yaw: f32,
    }

    #[test]
    fn numbers_pass_through() {
        let s: Sample = serde_json::from_str(r#"{"yaw": 1.5}"#).unwrap();
        assert_eq!(s.yaw, 1.5);
    }

    #[test]
    fn null_and_missing_become_nan() {
        let s: Sample = serde_json::from_str(r#"{"yaw": null}"#).unwrap();
        assert!(s.yaw.is_nan());
        let s: Sample = serde_json::from_str(r#"{}"#).unwrap();
        assert!(s.yaw.is_nan());
    }

    #[test]
    fn named_specials_parse() {
        let s: Sample = serde_json::from_str(r#"{"yaw": "inf"}"#).unwrap();
        assert!(s.yaw.is_infinite() && s.yaw > 0.0);
        let s: Sample = serde_json::from_str(r#"{"yaw": "nan"}"#).unwrap();
        assert!(s.yaw.is_nan());
    }

    #[test]
    fn nan_serializes_as_null() {
        let text = serde_json::to_string(&Sample { yaw: f32::NAN }).unwrap();
        assert_eq!(text, r#"{"yaw":null}"#);
    }
}
