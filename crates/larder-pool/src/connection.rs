use chrono::{DateTime, Utc};
use larder_core::Envelope;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// Whether a connection can still receive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Accepting events.
    Open,
    /// Removed from the pool.
    Closed,
}

/// One duplex client connection as the pool sees it.
#[derive(Debug)]
pub struct Connection {
    /// Connection id.
    pub id: Uuid,
    /// `None` until the connection is bound to a session.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Handshake time.
    pub opened_at: DateTime<Utc>,
    /// Last sign of life from the client.
    pub last_heartbeat: Instant,
    pub(crate) tx: mpsc::Sender<Envelope>,
}

impl Connection {
    /// Wrap an existing outbound sender.
    pub fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            state: ConnectionState::Open,
            opened_at: Utc::now(),
            last_heartbeat: Instant::now(),
            tx,
        }
    }

    /// A new connection plus the receiving end of its outbound channel.
    pub fn open(buffer: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    /// Bind to `session_id` on registration.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Whether the connection accepts events.
    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open && !self.tx.is_closed()
    }

    /// Snapshot without the sender.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            session_id: self.session_id.clone(),
            state: if self.is_open() {
                ConnectionState::Open
            } else {
                ConnectionState::Closed
            },
            opened_at: self.opened_at,
            silent_ms: self.last_heartbeat.elapsed().as_millis() as u64,
        }
    }
}

/// Serializable view of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: Uuid,
    /// Bound session, if any.
    pub session_id: Option<String>,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Handshake time.
    pub opened_at: DateTime<Utc>,
    /// Milliseconds since the last heartbeat.
    pub silent_ms: u64,
}
