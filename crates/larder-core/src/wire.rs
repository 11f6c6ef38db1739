//! Wire-safety boundary.
//!
//! Anything that leaves an agent and is stored in a job record or sent to a
//! client must be reducible to strings, numbers, booleans, ordered lists, and
//! string-keyed maps. The checks here reject everything else (including
//! `null`, integers a double cannot hold exactly, and pathologically deep
//! nesting) so the failure surfaces as a job error instead of a transport one.

use crate::error::{ErrorKind, LarderError, LarderResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A wire payload: a string-keyed JSON object.
pub type Payload = serde_json::Map<String, Value>;

/// Deepest nesting accepted in a payload.
pub const MAX_DEPTH: usize = 64;

/// Largest integer magnitude every consumer can represent exactly.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// The fixed `{kind, message}` shape every error is reduced to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Wire kind label.
    pub kind: String,
    /// Human-readable detail.
    pub message: String,
}

impl ErrorDescriptor {
    /// Descriptor for `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            message: message.into(),
        }
    }

    /// Parsed kind; unknown spellings are [`ErrorKind::Internal`].
    pub fn error_kind(&self) -> ErrorKind {
        ErrorKind::parse(&self.kind)
    }

    /// Rebuild a [`LarderError`] carrying this descriptor's message.
    pub fn into_error(self) -> LarderError {
        match self.error_kind() {
            ErrorKind::NotFound => LarderError::NotFound(self.message),
            ErrorKind::ConfigurationError => LarderError::Configuration(self.message),
            ErrorKind::Timeout => LarderError::Timeout(self.message),
            ErrorKind::QueueUnavailable => LarderError::QueueUnavailable(self.message),
            ErrorKind::SerializationError => LarderError::Serialization(self.message),
            ErrorKind::Cancelled => LarderError::Cancelled(self.message),
            ErrorKind::DeliveryFailure => LarderError::DeliveryFailure(self.message),
            ErrorKind::InvalidMessage => LarderError::InvalidMessage(self.message),
            ErrorKind::AgentError | ErrorKind::Internal => LarderError::Agent(self.message),
        }
    }
}

impl From<&LarderError> for ErrorDescriptor {
    fn from(err: &LarderError) -> Self {
        err.to_descriptor()
    }
}

/// Check that a single JSON value is wire-safe.
pub fn check_value(value: &Value) -> LarderResult<()> {
    check_at(value, "$", 0)
}

/// Check that every value inside a payload is wire-safe.
pub fn check_payload(payload: &Payload) -> LarderResult<()> {
    for (key, value) in payload {
        check_at(value, &format!("$.{key}"), 1)?;
    }
    Ok(())
}

/// Serialize any value into a wire-safe payload.
///
/// Fails with [`LarderError::Serialization`] if the value does not serialize,
/// is not an object at the top level, or contains a non wire-safe value.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> LarderResult<Payload> {
    let value = serde_json::to_value(value)
        .map_err(|e| LarderError::Serialization(format!("value does not serialize: {e}")))?;
    match value {
        Value::Object(map) => {
            check_payload(&map)?;
            Ok(map)
        }
        other => Err(LarderError::Serialization(format!(
            "expected an object at the top level, got {}",
            type_name(&other)
        ))),
    }
}

fn check_at(value: &Value, path: &str, depth: usize) -> LarderResult<()> {
    if depth > MAX_DEPTH {
        return Err(LarderError::Serialization(format!(
            "{path}: nesting deeper than {MAX_DEPTH}"
        )));
    }
    match value {
        Value::Null => Err(LarderError::Serialization(format!(
            "{path}: null is not wire-safe"
        ))),
        Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => {
            let exact = if let Some(u) = n.as_u64() {
                u <= MAX_SAFE_INTEGER
            } else if let Some(i) = n.as_i64() {
                i.unsigned_abs() <= MAX_SAFE_INTEGER
            } else {
                n.as_f64().is_some_and(f64::is_finite)
            };
            if exact {
                Ok(())
            } else {
                Err(LarderError::Serialization(format!(
                    "{path}: number {n} is not exactly representable"
                )))
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_at(item, &format!("{path}[{i}]"), depth + 1)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_at(item, &format!("{path}.{key}"), depth + 1)?;
            }
            Ok(())
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
