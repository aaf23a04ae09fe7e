use crate::scope::Branch;
use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const TYPE_FIELD: &str = "type";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
}

/// One decoded realtime frame. `payload` holds every field except `type`,
/// including `branch` and `date` which are also parsed into typed fields.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub event_type: String,
    pub branch: Option<Branch>,
    pub date: Option<NaiveDate>,
    pub payload: Map<String, Value>,
}

impl InboundEvent {
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        let branch = payload
            .get("branch")
            .and_then(Value::as_str)
            .and_then(|value| value.parse::<Branch>().ok());
        let date = payload
            .get("date")
            .and_then(Value::as_str)
            .and_then(|value| NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok());
        Self {
            event_type: event_type.into(),
            branch,
            date,
            payload,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Record ids arrive as either strings or numbers.
    pub fn id_field(&self, key: &str) -> Option<String> {
        match self.payload.get(key)? {
            Value::String(value) if !value.trim().is_empty() => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }
}

/// Builds `{"type": <event_type>, ...payload}`. A `type` key inside the
/// payload is ignored; `null` is treated as an empty payload.
pub fn encode_frame(
    event_type: &str,
    payload: &Value,
    max_frame_bytes: usize,
) -> Result<String, FrameError> {
    if event_type.trim().is_empty() {
        return Err(FrameError::MissingType);
    }
    let mut object = Map::new();
    match payload {
        Value::Null => {}
        Value::Object(fields) => {
            for (key, value) in fields {
                if key == TYPE_FIELD {
                    continue;
                }
                object.insert(key.clone(), value.clone());
            }
        }
        _ => return Err(FrameError::NotAnObject),
    }
    object.insert(TYPE_FIELD.to_string(), Value::String(event_type.to_string()));

    let encoded = serde_json::to_string(&Value::Object(object))
        .map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<InboundEvent, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Value::Object(mut fields) = value else {
        return Err(FrameError::NotAnObject);
    };
    let event_type = match fields.remove(TYPE_FIELD) {
        Some(Value::String(value)) if !value.trim().is_empty() => value,
        _ => return Err(FrameError::MissingType),
    };
    Ok(InboundEvent::new(event_type, fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_separates_type_from_payload() {
        let event = decode_frame(
            r#"{"type":"appointment_created","branch":"gagarina","date":"2024-06-01","appointment_id":42}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");

        assert_eq!(event.event_type, "appointment_created");
        assert_eq!(event.branch, Some(Branch::Gagarina));
        assert_eq!(
            event.date,
            NaiveDate::from_ymd_opt(2024, 6, 1)
        );
        assert!(!event.payload.contains_key("type"));
        assert_eq!(event.id_field("appointment_id"), Some("42".to_string()));
        assert_eq!(event.str_field("branch"), Some("gagarina"));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        let max = DEFAULT_MAX_FRAME_BYTES;
        assert!(matches!(
            decode_frame("{\"type\":", max),
            Err(FrameError::Decode(_))
        ));
        assert_eq!(decode_frame("[1,2]", max), Err(FrameError::NotAnObject));
        assert_eq!(
            decode_frame(r#"{"branch":"all"}"#, max),
            Err(FrameError::MissingType)
        );
        assert_eq!(
            decode_frame(r#"{"type":7}"#, max),
            Err(FrameError::MissingType)
        );
        assert!(matches!(
            decode_frame(&format!("{{\"type\":\"{}\"}}", "x".repeat(64)), 32),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn encode_puts_type_next_to_payload_fields() {
        let text = encode_frame(
            "appointment_deleted",
            &json!({"type": "spoofed", "branch": "all", "date": "2024-06-01", "appointment_id": 7}),
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["type"], "appointment_deleted");
        assert_eq!(value["appointment_id"], 7);

        let event = decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(event.branch, Some(Branch::All));
    }

    #[test]
    fn encode_rejects_non_object_payload_and_oversize() {
        assert_eq!(
            encode_frame("task_updated", &json!([1]), DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::NotAnObject)
        );
        assert_eq!(
            encode_frame("  ", &Value::Null, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::MissingType)
        );
        let huge = json!({"blob": "x".repeat(128)});
        assert!(matches!(
            encode_frame("task_updated", &huge, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        assert!(encode_frame("task_updated", &Value::Null, DEFAULT_MAX_FRAME_BYTES).is_ok());
    }
}
