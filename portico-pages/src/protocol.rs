//! The typed message protocol layered over WebSocket.
//!
//! Messages are JSON objects discriminated by `type`; request/response/
//! error carry a correlation `id` and the response echoes the request's.
//! The binary variant is the same schema over msgpack maps. Values inside
//! `params`, `result`, and `payload` follow the typed-codec rules when
//! typed mode is indicated.

use portico_core::{ServerError, WsPayload};
use serde::{Deserialize, Serialize};

/// Close code for a keepalive (idle) timeout.
pub const CLOSE_IDLE_TIMEOUT: u16 = 4408;
/// Default close code for a slow consumer (policy violation).
pub const CLOSE_SLOW_CONSUMER: u16 = 1008;
/// Close code for fatal framing errors.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Error body of an `rpc.error` frame.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

/// One protocol message.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum RpcMessage {
    #[serde(rename = "rpc.request")]
    Request {
        id: String,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        meta: serde_json::Value,
    },
    #[serde(rename = "rpc.response")]
    Response {
        id: String,
        result: serde_json::Value,
    },
    #[serde(rename = "rpc.error")]
    Error { id: String, error: RpcErrorBody },
    #[serde(rename = "rpc.notify")]
    Notify {
        channel: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "rpc.subscribe")]
    Subscribe { id: String, channel: String },
    #[serde(rename = "rpc.unsubscribe")]
    Unsubscribe { id: String, channel: String },
    #[serde(rename = "rpc.event")]
    Event {
        channel: String,
        payload: serde_json::Value,
    },
    #[serde(rename = "rpc.ping")]
    Ping { id: String },
    #[serde(rename = "rpc.pong")]
    Pong { id: String },
}

impl RpcMessage {
    /// Parse a frame from the wire; text is JSON, binary is msgpack.
    pub fn parse(payload: &WsPayload) -> Result<RpcMessage, ServerError> {
        match payload {
            WsPayload::Text(text) => serde_json::from_str(text)
                .map_err(|e| ServerError::Protocol(format!("bad rpc frame: {e}"))),
            WsPayload::Binary(bytes) => rmp_serde::from_slice(bytes)
                .map_err(|e| ServerError::Protocol(format!("bad binary rpc frame: {e}"))),
        }
    }

    /// Encode for the wire, matching the peer's framing choice.
    pub fn encode(&self, binary: bool) -> Result<WsPayload, ServerError> {
        if binary {
            rmp_serde::to_vec_named(self)
                .map(|bytes| WsPayload::Binary(bytes.into()))
                .map_err(|e| ServerError::Internal(format!("encode rpc frame: {e}")))
        } else {
            serde_json::to_string(self)
                .map(WsPayload::Text)
                .map_err(|e| ServerError::Internal(format!("encode rpc frame: {e}")))
        }
    }

    /// The correlation id, for frames that carry one.
    pub fn id(&self) -> Option<&str> {
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Response { id, .. }
            | RpcMessage::Error { id, .. }
            | RpcMessage::Subscribe { id, .. }
            | RpcMessage::Unsubscribe { id, .. }
            | RpcMessage::Ping { id }
            | RpcMessage::Pong { id } => Some(id),
            _ => None,
        }
    }

    /// An `rpc.error` frame answering `id`.
    pub fn error(id: &str, code: &str, message: &str) -> RpcMessage {
        RpcMessage::Error {
            id: id.to_string(),
            error: RpcErrorBody {
                code: code.to_string(),
                message: message.to_string(),
                details: serde_json::Value::Null,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_round_trips_as_text() {
        let frame = RpcMessage::Request {
            id: "r1".to_string(),
            method: "echo".to_string(),
            params: serde_json::json!({ "msg": "hi" }),
            meta: serde_json::Value::Null,
        };
        let encoded = frame.encode(false).unwrap();
        let text = match &encoded {
            WsPayload::Text(t) => t.clone(),
            other => panic!("expected text, got {other:?}"),
        };
        assert!(text.contains("\"type\":\"rpc.request\""));
        assert_eq!(RpcMessage::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn binary_variant_round_trips() {
        let frame = RpcMessage::Event {
            channel: "dbevent".to_string(),
            payload: serde_json::json!({ "table": "orders" }),
        };
        let encoded = frame.encode(true).unwrap();
        assert!(matches!(encoded, WsPayload::Binary(_)));
        assert_eq!(RpcMessage::parse(&encoded).unwrap(), frame);
    }

    #[test]
    fn wire_text_parses_expected_shape() {
        let payload = WsPayload::Text(
            r#"{"type":"rpc.request","id":"r1","method":"echo","params":{"msg":"hi"}}"#
                .to_string(),
        );
        match RpcMessage::parse(&payload).unwrap() {
            RpcMessage::Request {
                id, method, params, ..
            } => {
                assert_eq!(id, "r1");
                assert_eq!(method, "echo");
                assert_eq!(params["msg"], "hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        for bad in ["not json", r#"{"type":"rpc.unknown","id":"1"}"#, r#"{"id":"1"}"#] {
            assert!(matches!(
                RpcMessage::parse(&WsPayload::Text(bad.to_string())),
                Err(ServerError::Protocol(_))
            ));
        }
    }

    #[test]
    fn correlation_ids_are_exposed() {
        assert_eq!(
            RpcMessage::Ping { id: "k1".into() }.id(),
            Some("k1")
        );
        assert_eq!(
            RpcMessage::Event {
                channel: "c".into(),
                payload: serde_json::Value::Null
            }
            .id(),
            None
        );
    }
}
