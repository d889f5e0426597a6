//! Message envelope codec.
//!
//! Every frame on the wire is a single JSON text message:
//!
//! ```text
//! { "type"?: string, "data": any, "id": number, "kind"?: "event"|"request"|"response", "requestId"?: number }
//! ```
//!
//! - **Event**: `kind = "event"` (peers may omit it), `type` names the topic.
//! - **Request**: `kind = "request"`, answered by exactly one response.
//! - **Response**: `kind = "response"`, `requestId` names the request, no `type`.
//!
//! `id` is a per-sender counter starting at 1. Peers that predate the
//! explicit `kind` field answer requests with `id = -requestId` and no
//! `type`; [`decode`] maps those onto [`Frame::Response`] as well.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{ERROR_EVENT, SUBSCRIBE_EVENT};

/// Discriminant carried in the `kind` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Fire-and-forget push.
    Event,
    /// Push that expects one response.
    Request,
    /// Answer to a request.
    Response,
}

/// Raw wire representation, as serialized by serde.
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    kind: Option<FrameKind>,
    #[serde(rename = "requestId", default, skip_serializing_if = "Option::is_none")]
    request_id: Option<i64>,
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Named push, including the `subscribe` command.
    Event {
        /// Topic name.
        event_type: String,
        /// Payload.
        data: Value,
        /// Sender-local counter.
        id: i64,
    },
    /// Named push expecting a [`Frame::Response`] with `request_id == id`.
    Request {
        /// Topic name, used to pick the handler.
        event_type: String,
        /// Payload.
        data: Value,
        /// Sender-local counter, echoed back as `request_id`.
        id: i64,
    },
    /// Reply to an earlier request.
    Response {
        /// Id of the request being answered.
        request_id: i64,
        /// Reply payload.
        data: Value,
        /// Sender-local counter.
        id: i64,
    },
}

impl Frame {
    /// Build a `subscribe` command announcing the full wanted set.
    pub fn subscribe<I, S>(id: i64, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<Value> = names.into_iter().map(|n| Value::String(n.into())).collect();
        Self::Event {
            event_type: SUBSCRIBE_EVENT.to_string(),
            data: Value::Array(names),
            id,
        }
    }

    /// Build a strict-mode error report.
    pub fn error(id: i64, code: &str, message: &str, event: Option<&str>) -> Self {
        let mut data = serde_json::json!({ "code": code, "message": message });
        if let Some(event) = event {
            data["event"] = Value::String(event.to_string());
        }
        Self::Event {
            event_type: ERROR_EVENT.to_string(),
            data,
            id,
        }
    }

    /// Topic name, `None` for responses.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            Self::Event { event_type, .. } | Self::Request { event_type, .. } => Some(event_type),
            Self::Response { .. } => None,
        }
    }

    /// Payload.
    pub fn data(&self) -> &Value {
        match self {
            Self::Event { data, .. } | Self::Request { data, .. } | Self::Response { data, .. } => {
                data
            }
        }
    }

    /// Sender-local id.
    pub fn id(&self) -> i64 {
        match self {
            Self::Event { id, .. } | Self::Request { id, .. } | Self::Response { id, .. } => *id,
        }
    }

    /// Whether this is a `subscribe` command.
    pub fn is_subscribe(&self) -> bool {
        matches!(self, Self::Event { event_type, .. } if event_type == SUBSCRIBE_EVENT)
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        let wire = match self {
            Self::Event { event_type, data, id } => WireFrame {
                event_type: Some(event_type.clone()),
                data: data.clone(),
                id: *id,
                kind: Some(FrameKind::Event),
                request_id: None,
            },
            Self::Request { event_type, data, id } => WireFrame {
                event_type: Some(event_type.clone()),
                data: data.clone(),
                id: *id,
                kind: Some(FrameKind::Request),
                request_id: None,
            },
            Self::Response { request_id, data, id } => WireFrame {
                event_type: None,
                data: data.clone(),
                id: *id,
                kind: Some(FrameKind::Response),
                request_id: Some(*request_id),
            },
        };
        serde_json::to_string(&wire).map_err(|e| FrameError::Encode(e.to_string()))
    }
}

/// Parse a JSON text frame.
pub fn decode(text: &str) -> Result<Frame, FrameError> {
    let wire: WireFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    match (wire.kind, wire.event_type) {
        (None | Some(FrameKind::Event), Some(event_type)) => Ok(Frame::Event {
            event_type,
            data: wire.data,
            id: wire.id,
        }),
        (Some(FrameKind::Request), Some(event_type)) => Ok(Frame::Request {
            event_type,
            data: wire.data,
            id: wire.id,
        }),
        (Some(FrameKind::Request | FrameKind::Event), None) => Err(FrameError::MissingType),
        (Some(FrameKind::Response), _) => {
            let request_id = wire.request_id.ok_or(FrameError::MissingRequestId)?;
            Ok(Frame::Response {
                request_id,
                data: wire.data,
                id: wire.id,
            })
        }
        // Legacy response: negated request id, no type, no kind.
        (None, None) if wire.id < 0 => {
            let request_id = wire
                .id
                .checked_neg()
                .ok_or_else(|| FrameError::Malformed(format!("request id {} out of range", wire.id)))?;
            Ok(Frame::Response {
                request_id,
                data: wire.data,
                id: wire.id,
            })
        }
        (None, None) => Err(FrameError::MissingType),
    }
}

/// Errors produced by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Text was not a JSON object of the expected shape.
    Malformed(String),
    /// Event or request frame without a `type`.
    MissingType,
    /// Response frame without a `requestId`.
    MissingRequestId,
    /// Payload could not be serialized.
    Encode(String),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed frame: {msg}"),
            Self::MissingType => write!(f, "Frame has no type"),
            Self::MissingRequestId => write!(f, "Response frame has no requestId"),
            Self::Encode(msg) => write!(f, "Frame encode failed: {msg}"),
        }
    }
}

impl std::error::Error for FrameError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_encodes_event_kind() {
        let frame = Frame::Event {
            event_type: "woth".into(),
            data: json!({ "word": "foo" }),
            id: 3,
        };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({ "type": "woth", "data": { "word": "foo" }, "id": 3, "kind": "event" })
        );
    }

    #[test]
    fn test_decode_event_without_kind() {
        let frame = decode(r#"{"type":"woth","data":1,"id":2}"#).unwrap();
        assert!(matches!(frame, Frame::Event { id: 2, .. }));
    }

    #[test]
    fn test_response_carries_request_id() {
        let frame = Frame::Response {
            request_id: 7,
            data: json!(42),
            id: 9,
        };
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "response");
        assert_eq!(value["requestId"], 7);
        assert!(value.get("type").is_none());
    }

    #[test]
    fn test_decode_request() {
        let frame = decode(r#"{"type":"ping","data":5,"id":4,"kind":"request"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Request {
                event_type: "ping".into(),
                data: json!(5),
                id: 4
            }
        );
    }

    #[test]
    fn test_decode_legacy_negative_id_response() {
        let frame = decode(r#"{"data":42,"id":-12}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Response {
                request_id: 12,
                data: json!(42),
                id: -12
            }
        );
    }

    #[test]
    fn test_decode_legacy_response_with_min_id_is_malformed() {
        let result = decode(r#"{"data":1,"id":-9223372036854775808}"#);
        assert!(matches!(result, Err(FrameError::Malformed(_))), "{result:?}");
    }

    #[test]
    fn test_decode_subscribe_without_id() {
        let frame = decode(r#"{"type":"subscribe","data":["a","b"]}"#).unwrap();
        assert!(frame.is_subscribe());
        assert_eq!(frame.id(), 0);
        assert_eq!(frame.data(), &json!(["a", "b"]));
    }

    #[test]
    fn test_decode_missing_data_is_null() {
        let frame = decode(r#"{"type":"tick","id":1}"#).unwrap();
        assert_eq!(frame.data(), &Value::Null);
    }

    #[test]
    fn test_decode_rejects_non_json() {
        assert!(matches!(decode("not json"), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_untyped_positive_id() {
        assert_eq!(decode(r#"{"data":1,"id":5}"#), Err(FrameError::MissingType));
    }

    #[test]
    fn test_decode_response_without_request_id() {
        assert_eq!(
            decode(r#"{"data":1,"id":5,"kind":"response"}"#),
            Err(FrameError::MissingRequestId)
        );
    }

    #[test]
    fn test_error_frame_shape() {
        let frame = Frame::error(2, "unknown_event", "no such event", Some("nope"));
        assert_eq!(frame.event_type(), Some("error"));
        assert_eq!(frame.data()["code"], "unknown_event");
        assert_eq!(frame.data()["event"], "nope");
    }
}
