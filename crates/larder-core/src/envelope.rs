use crate::error::{LarderError, LarderResult};
use crate::invocation::InvocationStatus;
use crate::wire::{ErrorDescriptor, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// The message type carried by an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Client -> server: `{ "text": string }`.
    Query,
    /// Server -> client: `{ "invocation_id", "state": "queued"|"running" }`.
    Status,
    /// Server -> client: `{ "invocation_id", "output": object }`.
    Result,
    /// Server -> client: `{ "invocation_id", "kind", "message" }`.
    Error,
    /// Both directions, empty payload.
    Heartbeat,
}

/// A realtime message exchanged between a client and the connection pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Frame kind, serialized as `type`.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Owning session; empty for unbound replies.
    pub session_id: String,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Payload,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub ts: DateTime<Utc>,
}

impl Envelope {
    fn new(event_type: EventType, session_id: impl Into<String>, payload: Value) -> Self {
        let payload = match payload {
            Value::Object(map) => map,
            _ => Payload::new(),
        };
        Self {
            event_type,
            session_id: session_id.into(),
            payload,
            ts: Utc::now(),
        }
    }

    /// A client `query` frame.
    pub fn query(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EventType::Query, session_id, json!({ "text": text.into() }))
    }

    /// A `status` event. Only `queued` and `running` are meaningful here;
    /// terminal states travel as `result`/`error`.
    pub fn status(session_id: impl Into<String>, invocation_id: Uuid, state: InvocationStatus) -> Self {
        Self::new(
            EventType::Status,
            session_id,
            json!({ "invocation_id": invocation_id.to_string(), "state": state.as_str() }),
        )
    }

    /// A `result` event.
    pub fn result(session_id: impl Into<String>, invocation_id: Uuid, output: Payload) -> Self {
        Self::new(
            EventType::Result,
            session_id,
            json!({ "invocation_id": invocation_id.to_string(), "output": Value::Object(output) }),
        )
    }

    /// An `error` event. `invocation_id` is empty for frame-level errors that
    /// do not belong to any invocation.
    pub fn error(session_id: impl Into<String>, invocation_id: Option<Uuid>, error: &ErrorDescriptor) -> Self {
        let id = invocation_id.map(|id| id.to_string()).unwrap_or_default();
        Self::new(
            EventType::Error,
            session_id,
            json!({ "invocation_id": id, "kind": error.kind, "message": error.message }),
        )
    }

    /// A `heartbeat` frame.
    pub fn heartbeat(session_id: impl Into<String>) -> Self {
        Self::new(EventType::Heartbeat, session_id, json!({}))
    }

    /// Parse a client frame. Malformed frames are [`LarderError::InvalidMessage`].
    pub fn parse(text: &str) -> LarderResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| LarderError::InvalidMessage(format!("malformed envelope: {e}")))
    }

    /// Encode for the wire.
    pub fn to_json(&self) -> LarderResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The `text` of a `query` envelope.
    pub fn query_text(&self) -> LarderResult<&str> {
        if self.event_type != EventType::Query {
            return Err(LarderError::InvalidMessage(format!(
                "expected a query, got {:?}",
                self.event_type
            )));
        }
        self.payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| LarderError::InvalidMessage("query payload needs a string 'text'".into()))
    }

    /// The `invocation_id` carried by status/result/error payloads.
    pub fn invocation_id(&self) -> Option<&str> {
        self.payload.get("invocation_id").and_then(Value::as_str)
    }

    /// The `state` of a status payload.
    pub fn state(&self) -> Option<&str> {
        self.payload.get("state").and_then(Value::as_str)
    }

    /// Whether this ends an invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, EventType::Result | EventType::Error)
    }
}
