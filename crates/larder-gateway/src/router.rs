use larder_core::{Envelope, ErrorDescriptor, EventType, LarderError, LarderResult};
use larder_orchestrator::{OrchestrationResult, Orchestrator};
use larder_pool::ConnectionPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum Routed {
    /// A query was accepted and is running on its own task.
    Query(JoinHandle<LarderResult<OrchestrationResult>>),
    /// A client heartbeat was recorded.
    Heartbeat,
    /// The frame was refused and an `error` event sent back.
    Rejected(ErrorDescriptor),
}

/// Routes client frames: queries go to the orchestrator, heartbeats to the
/// pool. Anything else is answered with an `invalid_message` error.
pub struct MessageRouter {
    orchestrator: Arc<Orchestrator>,
    pool: Arc<ConnectionPool>,
}

impl MessageRouter {
    /// Router over the given orchestrator and pool.
    pub fn new(orchestrator: Arc<Orchestrator>, pool: Arc<ConnectionPool>) -> Self {
        Self { orchestrator, pool }
    }

    /// Handle one text frame from `connection_id`. Every frame counts as
    /// liveness.
    pub fn handle_frame(&self, text: &str, connection_id: Uuid) -> Routed {
        if let Err(e) = self.pool.heartbeat(connection_id) {
            debug!(connection_id = %connection_id, error = %e, "Frame from unregistered connection");
        }
        match self.route(text, connection_id) {
            Ok(routed) => routed,
            Err(e) => self.reject(connection_id, &e),
        }
    }

    /// Answer `connection_id` with an `error` event that belongs to no
    /// invocation.
    pub fn reject(&self, connection_id: Uuid, error: &LarderError) -> Routed {
        let descriptor = error.to_descriptor();
        warn!(connection_id = %connection_id, kind = %descriptor.kind, error = %error, "Frame rejected");
        if let Err(e) = self.pool.send_to(connection_id, Envelope::error("", None, &descriptor)) {
            debug!(connection_id = %connection_id, error = %e, "Could not send rejection");
        }
        Routed::Rejected(descriptor)
    }

    fn route(&self, text: &str, connection_id: Uuid) -> LarderResult<Routed> {
        let envelope = Envelope::parse(text)?;
        match envelope.event_type {
            EventType::Heartbeat => Ok(Routed::Heartbeat),
            EventType::Query => {
                let session_id = envelope.session_id.trim().to_string();
                if session_id.is_empty() {
                    return Err(LarderError::InvalidMessage("query has no session_id".into()));
                }
                let query = envelope.query_text()?.to_string();
                self.pool.bind(connection_id, &session_id)?;
                info!(connection_id = %connection_id, session_id = %session_id, "Query received");

                let orchestrator = self.orchestrator.clone();
                Ok(Routed::Query(tokio::spawn(async move {
                    let result = orchestrator.process_query(&query, &session_id).await;
                    if let Err(e) = &result {
                        warn!(session_id = %session_id, error = %e, "Query not processed");
                    }
                    result
                })))
            }
            other => Err(LarderError::InvalidMessage(format!(
                "clients may not send {other:?} events"
            ))),
        }
    }
}
