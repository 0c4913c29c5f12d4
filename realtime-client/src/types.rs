//! Public types for the realtime-client crate.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;

/// Lifecycle state of the persistent connection.
///
/// Only the connection task moves between states; consumers observe them
/// through [`Handle::status`](crate::Handle::status) and
/// [`Handle::state_changes`](crate::Handle::state_changes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport and no pending retry. Initial and manual-terminal state.
    #[default]
    Disconnected,
    /// Handshake in flight.
    Connecting,
    /// Handshake completed; sends are accepted.
    Open,
    /// Transport ended unexpectedly; a retry may be pending.
    Closed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discrete unit of data read from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// A decoded inbound or outbound record.
///
/// Payloads are JSON objects. By convention they carry a `type` field that
/// consumers switch on; the client itself never looks past the object shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Build a payload with only its `type` discriminator set.
    pub fn of_type(kind: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(kind.into()));
        Self(map)
    }

    /// Add or replace a field, builder style.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// The `type` discriminator, if present and a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Decode a frame. Fails if the frame is not JSON or not a JSON object.
    pub fn decode(frame: &Frame) -> Result<Self, Error> {
        let value: Value = match frame {
            Frame::Text(text) => serde_json::from_str(text)?,
            Frame::Binary(bytes) => serde_json::from_slice(bytes)?,
        };
        Self::try_from(value)
    }

    /// Encode as a JSON text frame body.
    pub fn encode(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&self.0)?)
    }
}

impl From<Map<String, Value>> for Payload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Payload {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::NotARecord),
        }
    }
}

impl From<Payload> for Value {
    fn from(payload: Payload) -> Self {
        Value::Object(payload.0)
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotARecord,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_text_object() {
        let frame = Frame::Text(r#"{"type":"chat","body":"hi"}"#.to_string());
        let payload = Payload::decode(&frame).unwrap();
        assert_eq!(payload.kind(), Some("chat"));
        assert_eq!(payload.get("body"), Some(&json!("hi")));
    }

    #[test]
    fn decode_binary_utf8_object() {
        let frame = Frame::Binary(br#"{"type":"doc_status","id":7}"#.to_vec());
        let payload = Payload::decode(&frame).unwrap();
        assert_eq!(payload.kind(), Some("doc_status"));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = Payload::decode(&Frame::Text("{not json".to_string())).unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = Payload::decode(&Frame::Text("[1,2,3]".to_string())).unwrap_err();
        assert!(matches!(err, Error::NotARecord));
        let err = Payload::decode(&Frame::Text("\"type\"".to_string())).unwrap_err();
        assert!(matches!(err, Error::NotARecord));
    }

    #[test]
    fn payload_without_type_is_still_a_record() {
        let payload = Payload::decode(&Frame::Text(r#"{"body":1}"#.to_string())).unwrap();
        assert_eq!(payload.kind(), None);
    }

    #[test]
    fn builder_and_encode() {
        let payload = Payload::of_type("chat").with("body", "hello").with("seq", 3);
        let text = payload.encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "chat", "body": "hello", "seq": 3}));
    }

    #[test]
    fn state_display_matches_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
        }
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }
}
