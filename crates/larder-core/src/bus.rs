use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single connection that could not be reached during delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDelivery {
    /// Connection that was not reached.
    pub connection_id: Uuid,
    /// Why.
    pub reason: String,
}

/// Outcome of delivering one event to every connection bound to a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Target session.
    pub session_id: String,
    /// Connections that accepted the event.
    pub delivered: Vec<Uuid>,
    /// Connections that did not.
    pub failed: Vec<FailedDelivery>,
}

impl DeliveryReport {
    /// Empty report.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            delivered: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Number of connections the event was attempted on.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// No connection failed.
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// The seam between the orchestrator and whatever holds client connections.
///
/// Sessions are provisioned and events delivered only through this trait,
/// so the orchestrator never mutates session records directly.
#[async_trait]
pub trait SessionBus: Send + Sync {
    /// Provision `session_id` if it does not exist yet. Returns `true` when a
    /// new session was created.
    fn ensure_session(&self, session_id: &str) -> bool;

    /// Deliver `event` to every connection bound to `session_id`.
    async fn deliver(&self, session_id: &str, event: Envelope) -> DeliveryReport;
}
