use crate::error::ErrorKind;
use crate::wire::{ErrorDescriptor, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an agent invocation.
///
/// `queued -> running -> {succeeded | failed | timed-out}`; a queued
/// invocation may also finish directly (cancelled or rejected before it
/// started). Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvocationStatus {
    /// Accepted, not started.
    Queued,
    /// Executing.
    Running,
    /// Finished with output.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Did not finish in time.
    TimedOut,
}

impl InvocationStatus {
    /// No further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InvocationStatus::Succeeded | InvocationStatus::Failed | InvocationStatus::TimedOut
        )
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: InvocationStatus) -> bool {
        match (self, next) {
            (InvocationStatus::Queued, InvocationStatus::Running) => true,
            (InvocationStatus::Queued | InvocationStatus::Running, n) => n.is_terminal(),
            _ => false,
        }
    }

    /// Wire spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Queued => "queued",
            InvocationStatus::Running => "running",
            InvocationStatus::Succeeded => "succeeded",
            InvocationStatus::Failed => "failed",
            InvocationStatus::TimedOut => "timed-out",
        }
    }
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution request against an agent, tracked through a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInvocation {
    /// Invocation id; also the job id when queued.
    pub id: Uuid,
    /// Agent name as requested.
    pub agent: String,
    /// Owning session.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Agent input.
    pub input: Payload,
    /// Creation time.
    pub submitted_at: DateTime<Utc>,
    /// Time of the last transition.
    pub updated_at: DateTime<Utc>,
    /// Current status.
    pub status: InvocationStatus,
    /// Present iff `status == Succeeded`.
    #[serde(default)]
    pub result: Option<Payload>,
    /// Present iff `status` is `Failed` or `TimedOut`.
    #[serde(default)]
    pub error: Option<ErrorDescriptor>,
}

impl AgentInvocation {
    /// A queued invocation.
    pub fn new(agent: impl Into<String>, input: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent: agent.into(),
            session_id: None,
            input,
            submitted_at: now,
            updated_at: now,
            status: InvocationStatus::Queued,
            result: None,
            error: None,
        }
    }

    /// Attach the owning session.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// No further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `queued -> running`. Returns `false` (and changes nothing) otherwise.
    pub fn mark_running(&mut self) -> bool {
        self.transition(InvocationStatus::Running)
    }

    /// Finish successfully with `output`.
    pub fn succeed(&mut self, output: Payload) -> bool {
        if !self.transition(InvocationStatus::Succeeded) {
            return false;
        }
        self.result = Some(output);
        true
    }

    /// Finish as failed. A descriptor of kind `timeout` finishes as
    /// `timed-out` instead.
    pub fn fail(&mut self, error: ErrorDescriptor) -> bool {
        let status = if error.error_kind() == ErrorKind::Timeout {
            InvocationStatus::TimedOut
        } else {
            InvocationStatus::Failed
        };
        if !self.transition(status) {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// Finish as timed out.
    pub fn time_out(&mut self, message: impl Into<String>) -> bool {
        self.fail(ErrorDescriptor::new(ErrorKind::Timeout, message))
    }

    /// Finish as failed with a `cancelled` error.
    pub fn cancel(&mut self, message: impl Into<String>) -> bool {
        self.fail(ErrorDescriptor::new(ErrorKind::Cancelled, message))
    }

    fn transition(&mut self, next: InvocationStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}
