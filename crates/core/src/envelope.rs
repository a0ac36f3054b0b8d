//! Message envelope shared by the ephemeral and durable fabrics
//!
//! Every inter-service message is wrapped in the same envelope so that
//! tracing, origin and temporal ordering are uniform across both buses.
//! Payload fields are flattened at the top level next to the metadata.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;

/// Structured error carried inside a reply envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: String,
    pub message: String,
}

/// Uniform wrapper for every inter-service message.
///
/// `timestamp` is RFC 3339 UTC. `trace_id` is opaque and propagated across
/// bus boundaries; a fresh one is generated when the producer has none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub timestamp: String,
    pub trace_id: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Wrap a payload with metadata.
    ///
    /// Non-object payloads are nested under a `data` key so the flattened
    /// representation stays a JSON object.
    pub fn wrap(
        payload: Value,
        trace_id: Option<&str>,
        event_type: Option<&str>,
        service: &str,
    ) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            },
        };

        Self {
            timestamp: now_rfc3339(),
            trace_id: trace_id
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            service: service.to_string(),
            event_type: event_type.map(str::to_string),
            payload,
        }
    }

    /// Build an error reply envelope carrying `{error: {kind, message}}`.
    pub fn error(err: WireError, trace_id: &str, service: &str) -> Self {
        let mut payload = Map::new();
        payload.insert(
            "error".to_string(),
            serde_json::json!({ "kind": err.kind, "message": err.message }),
        );
        Self {
            timestamp: now_rfc3339(),
            trace_id: trace_id.to_string(),
            service: service.to_string(),
            event_type: None,
            payload,
        }
    }

    /// Parse an envelope from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::MalformedMessage(e.to_string()))
    }

    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // An envelope is a string-keyed map; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Error carried by this envelope, if any.
    pub fn wire_error(&self) -> Option<WireError> {
        let err = self.payload.get("error")?;
        Some(WireError {
            kind: err
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            message: err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }

    /// Deserialize the flattened payload into a typed value.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| CoreError::MalformedMessage(e.to_string()))
    }

    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_generates_trace_id() {
        let env = Envelope::wrap(serde_json::json!({"a": 1}), None, Some("test"), "svc");
        assert!(!env.trace_id.is_empty());
        assert_eq!(env.service, "svc");
        assert_eq!(env.event_type.as_deref(), Some("test"));
        assert_eq!(env.payload.get("a"), Some(&Value::from(1)));
    }

    #[test]
    fn test_wrap_preserves_trace_id() {
        let env = Envelope::wrap(serde_json::json!({}), Some("trace-1"), None, "svc");
        assert_eq!(env.trace_id, "trace-1");
    }

    #[test]
    fn test_empty_trace_id_replaced() {
        let env = Envelope::wrap(serde_json::json!({}), Some(""), None, "svc");
        assert!(!env.trace_id.is_empty());
    }

    #[test]
    fn test_round_trip() {
        let env = Envelope::wrap(
            serde_json::json!({"user_id": "u1", "count": 3}),
            Some("t-9"),
            Some("turn_completed"),
            "brain",
        );
        let parsed = Envelope::parse(&env.to_bytes()).unwrap();
        assert_eq!(parsed.trace_id, "t-9");
        assert_eq!(parsed.event_type.as_deref(), Some("turn_completed"));
        assert_eq!(parsed.payload.get("user_id"), Some(&Value::from("u1")));
        assert_eq!(parsed.payload.get("count"), Some(&Value::from(3)));
        assert_eq!(parsed.service, "brain");
    }

    #[test]
    fn test_parse_malformed() {
        let err = Envelope::parse(b"not json").unwrap_err();
        assert!(matches!(err, CoreError::MalformedMessage(_)));
    }

    #[test]
    fn test_non_object_payload_nested() {
        let env = Envelope::wrap(Value::from("bare"), None, None, "svc");
        assert_eq!(env.payload.get("data"), Some(&Value::from("bare")));
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error(
            WireError {
                kind: "timeout".to_string(),
                message: "deadline exceeded".to_string(),
            },
            "trace-2",
            "brain",
        );
        let err = env.wire_error().unwrap();
        assert_eq!(err.kind, "timeout");
        assert_eq!(env.trace_id, "trace-2");
    }

    #[test]
    fn test_timestamp_is_rfc3339() {
        let env = Envelope::wrap(serde_json::json!({}), None, None, "svc");
        assert!(env.parsed_timestamp().is_some());
    }
}
