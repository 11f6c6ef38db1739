use crate::pool::ConnectionPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;
use uuid::Uuid;

/// What one monitor tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Connections force-closed.
    pub disconnected: Vec<Uuid>,
    /// Idle sessions removed.
    pub expired_sessions: Vec<String>,
    /// Server heartbeats sent.
    pub heartbeats_sent: usize,
}

/// Periodic liveness pass over a [`ConnectionPool`].
///
/// Every heartbeat interval it force-closes silent connections, pings the
/// rest, and expires idle sessions. Expired session ids are handed to the
/// callback so their in-flight work can be cancelled.
pub struct HeartbeatMonitor {
    pool: Arc<ConnectionPool>,
}

impl HeartbeatMonitor {
    /// Monitor for `pool`.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Run one pass as of `now`.
    pub fn tick(&self, now: Instant) -> TickReport {
        let disconnected = self.pool.sweep(now);
        let heartbeats_sent = self.pool.heartbeat_all();
        let expired_sessions = self.pool.sweep_sessions(now);
        debug!(
            disconnected = disconnected.len(),
            expired = expired_sessions.len(),
            heartbeats_sent,
            "Heartbeat tick"
        );
        TickReport {
            disconnected,
            expired_sessions,
            heartbeats_sent,
        }
    }

    /// Tick every heartbeat interval until the task is aborted.
    pub fn spawn<F>(self, on_expired: F) -> JoinHandle<()>
    where
        F: Fn(Vec<String>) + Send + Sync + 'static,
    {
        let period = self.pool.config().heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.tick(Instant::now());
                if !report.expired_sessions.is_empty() {
                    on_expired(report.expired_sessions);
                }
            }
        })
    }
}
