use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::time::Instant;
use uuid::Uuid;

/// A logical conversation. Outlives any single connection bound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id.
    pub id: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last delivery, bind or heartbeat.
    pub last_activity: DateTime<Utc>,
    /// Bound connections.
    pub connections: BTreeSet<Uuid>,
    #[serde(skip, default = "Instant::now")]
    pub(crate) last_seen: Instant,
}

impl Session {
    /// Empty session.
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_activity: now,
            connections: BTreeSet::new(),
            last_seen: Instant::now(),
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_seen = Instant::now();
    }

    /// No connections bound.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
