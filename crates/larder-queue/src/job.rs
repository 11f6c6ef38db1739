use larder_core::wire::check_payload;
use larder_core::{AgentInvocation, ErrorDescriptor, InvocationStatus, LarderError, LarderResult, Payload};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The serialized form of a job as it travels to workers and back.
///
/// `{"job_id", "agent", "input", "status", "result", "error"}`. Every field
/// is wire-safe; `result` and `error` are present only in terminal records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Equals the invocation id.
    pub job_id: Uuid,
    /// Agent to run.
    pub agent: String,
    /// Agent input.
    pub input: Payload,
    /// Current status.
    pub status: InvocationStatus,
    /// Output once succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    /// Error once failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl JobRecord {
    /// Encode to JSON after checking every payload is wire-safe.
    pub fn to_json(&self) -> LarderResult<String> {
        check_payload(&self.input)?;
        if let Some(result) = &self.result {
            check_payload(result)?;
        }
        serde_json::to_string(self).map_err(|e| LarderError::Serialization(e.to_string()))
    }

    /// Decode a wire record.
    pub fn from_json(text: &str) -> LarderResult<Self> {
        let record: JobRecord =
            serde_json::from_str(text).map_err(|e| LarderError::Serialization(e.to_string()))?;
        check_payload(&record.input)?;
        Ok(record)
    }
}

impl From<&AgentInvocation> for JobRecord {
    fn from(inv: &AgentInvocation) -> Self {
        Self {
            job_id: inv.id,
            agent: inv.agent.clone(),
            input: inv.input.clone(),
            status: inv.status,
            result: inv.result.clone(),
            error: inv.error.clone(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn input() -> Payload {
        json!({"text": "leek soup"}).as_object().cloned().unwrap()
    }

    #[test]
    fn test_record_shape() {
        let inv = AgentInvocation::new("recipe", input());
        let record = JobRecord::from(&inv);
        let value: Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(value["job_id"], inv.id.to_string());
        assert_eq!(value["agent"], "recipe");
        assert_eq!(value["status"], "queued");
        assert!(value.get("result").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_terminal_record_round_trips() {
        let mut inv = AgentInvocation::new("recipe", input());
        inv.mark_running();
        inv.time_out("recipe exceeded 100ms");
        let record = JobRecord::from(&inv);
        let back = JobRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.status, InvocationStatus::TimedOut);
        assert_eq!(back.error.unwrap().kind, "timeout");
    }

    #[test]
    fn test_unsafe_input_refused() {
        let mut inv = AgentInvocation::new("recipe", input());
        inv.input.insert("note".into(), Value::Null);
        assert!(JobRecord::from(&inv).to_json().is_err());
    }
}
