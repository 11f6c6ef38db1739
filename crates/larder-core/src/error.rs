use crate::wire::ErrorDescriptor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` alias using [`LarderError`].
pub type LarderResult<T> = Result<T, LarderError>;

/// Top-level error type for the Larder dispatch core.
///
/// Every variant maps onto a stable [`ErrorKind`] so that it can be reduced
/// to a wire-safe `{kind, message}` pair before it reaches a client or the
/// task queue's storage.
#[derive(Debug, Error)]
pub enum LarderError {
    /// Unknown agent name/alias, job id, connection id, or session.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate alias, malformed descriptor, invalid config. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An agent exceeded its configured duration.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The task queue stayed unreachable after the retry budget was spent.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A value could not be reduced to the wire-safe format.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The owning session was torn down mid-invocation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// One connection could not be reached.
    #[error("Delivery failure: {0}")]
    DeliveryFailure(String),

    /// An agent reported a business-level failure.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A client frame was malformed or carried an unsupported type.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable, client-visible classification of a [`LarderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// `not_found`
    NotFound,
    /// `configuration_error`
    ConfigurationError,
    /// `timeout`
    Timeout,
    /// `queue_unavailable`
    QueueUnavailable,
    /// `serialization_error`
    SerializationError,
    /// `cancelled`
    Cancelled,
    /// `delivery_failure`
    DeliveryFailure,
    /// `agent_error`
    AgentError,
    /// `invalid_message`
    InvalidMessage,
    /// `internal`
    Internal,
}

impl ErrorKind {
    /// The wire spelling of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::ConfigurationError => "configuration_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::SerializationError => "serialization_error",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeliveryFailure => "delivery_failure",
            ErrorKind::AgentError => "agent_error",
            ErrorKind::InvalidMessage => "invalid_message",
            ErrorKind::Internal => "internal",
        }
    }

    /// Parse a wire spelling back into a kind. Unknown spellings map to
    /// [`ErrorKind::Internal`].
    pub fn parse(kind: &str) -> Self {
        match kind {
            "not_found" => ErrorKind::NotFound,
            "configuration_error" => ErrorKind::ConfigurationError,
            "timeout" => ErrorKind::Timeout,
            "queue_unavailable" => ErrorKind::QueueUnavailable,
            "serialization_error" => ErrorKind::SerializationError,
            "cancelled" => ErrorKind::Cancelled,
            "delivery_failure" => ErrorKind::DeliveryFailure,
            "agent_error" => ErrorKind::AgentError,
            "invalid_message" => ErrorKind::InvalidMessage,
            _ => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LarderError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LarderError::NotFound(_) => ErrorKind::NotFound,
            LarderError::Configuration(_) => ErrorKind::ConfigurationError,
            LarderError::Timeout(_) => ErrorKind::Timeout,
            LarderError::QueueUnavailable(_) => ErrorKind::QueueUnavailable,
            LarderError::Serialization(_) | LarderError::Json(_) => {
                ErrorKind::SerializationError
            }
            LarderError::Cancelled(_) => ErrorKind::Cancelled,
            LarderError::DeliveryFailure(_) => ErrorKind::DeliveryFailure,
            LarderError::Agent(_) => ErrorKind::AgentError,
            LarderError::InvalidMessage(_) => ErrorKind::InvalidMessage,
            LarderError::Io(_) => ErrorKind::Internal,
        }
    }

    /// The human-readable message without the kind prefix.
    pub fn message(&self) -> String {
        match self {
            LarderError::NotFound(m)
            | LarderError::Configuration(m)
            | LarderError::Timeout(m)
            | LarderError::QueueUnavailable(m)
            | LarderError::Serialization(m)
            | LarderError::Cancelled(m)
            | LarderError::DeliveryFailure(m)
            | LarderError::Agent(m)
            | LarderError::InvalidMessage(m) => m.clone(),
            LarderError::Json(e) => e.to_string(),
            LarderError::Io(e) => e.to_string(),
        }
    }

    /// Reduce this error to its wire-safe `{kind, message}` shape.
    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor::new(self.kind(), self.message())
    }
}
