use crate::connection::{Connection, ConnectionInfo};
use crate::session::Session;
use async_trait::async_trait;
use futures_util::future::join_all;
use larder_core::{DeliveryReport, Envelope, FailedDelivery, LarderError, LarderResult, SessionBus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Pool limits and liveness timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Expected client heartbeat period.
    pub heartbeat_interval: Duration,
    /// Outbound events buffered per connection.
    pub buffer: usize,
    /// How long delivery waits on a full buffer before dropping the connection.
    pub send_timeout: Duration,
    /// Upper bound on registered connections.
    pub max_connections: usize,
    /// How long a session with no connections is kept.
    pub session_idle_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            buffer: 64,
            send_timeout: Duration::from_secs(2),
            max_connections: 10_000,
            session_idle_ttl: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    /// Silence after which a connection is force-closed.
    pub fn liveness_deadline(&self) -> Duration {
        self.heartbeat_interval * 2
    }
}

/// Pool gauges and lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Open connections.
    pub connections: usize,
    /// Known sessions, including ones with no connections.
    pub sessions: usize,
    /// Connections ever registered.
    pub registered: u64,
    /// Connections ever removed, for any reason.
    pub deregistered: u64,
    /// Connections removed for missed heartbeats or a stalled buffer.
    pub forced_disconnects: u64,
    /// Events handed to a connection's buffer.
    pub delivered: u64,
    /// Events that could not be handed over.
    pub delivery_failures: u64,
    /// Idle sessions removed by the TTL sweep.
    pub sessions_expired: u64,
}

#[derive(Default)]
struct PoolCounters {
    registered: AtomicU64,
    deregistered: AtomicU64,
    forced_disconnects: AtomicU64,
    delivered: AtomicU64,
    delivery_failures: AtomicU64,
    sessions_expired: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<Uuid, Connection>,
    sessions: HashMap<String, Session>,
}

impl PoolState {
    fn ensure_session(&mut self, session_id: &str) -> (&mut Session, bool) {
        let created = !self.sessions.contains_key(session_id);
        let session = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        (session, created)
    }

    /// Remove a connection from every index.
    fn detach(&mut self, connection_id: Uuid) -> Option<Connection> {
        let conn = self.connections.remove(&connection_id)?;
        if let Some(session_id) = &conn.session_id {
            if let Some(session) = self.sessions.get_mut(session_id) {
                session.connections.remove(&connection_id);
                session.touch();
            }
        }
        Some(conn)
    }
}

/// Every live client connection, indexed by session.
///
/// One mutex guards both the connection table and the session index so a
/// connection is added to or removed from both in a single step. Delivery
/// copies the target senders out under the lock and sends without it.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
    counters: PoolCounters,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            config,
            counters: PoolCounters::default(),
        }
    }

    /// Limits and timing the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Add a connection. A connection that already names a session is bound
    /// to it immediately.
    pub fn register(&self, connection: Connection) -> LarderResult<()> {
        let id = connection.id;
        let session_id = connection.session_id.clone();
        {
            let mut state = self.state.lock();
            if state.connections.contains_key(&id) {
                return Err(LarderError::Configuration(format!(
                    "connection {id} is already registered"
                )));
            }
            if state.connections.len() >= self.config.max_connections {
                return Err(LarderError::DeliveryFailure(format!(
                    "pool is full ({} connections)",
                    self.config.max_connections
                )));
            }
            if let Some(session_id) = &session_id {
                let (session, _) = state.ensure_session(session_id);
                session.connections.insert(id);
                session.touch();
            }
            state.connections.insert(id, connection);
        }
        self.counters.registered.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = %id, session_id = ?session_id, "Connection registered");
        Ok(())
    }

    /// Attach a connection to a session, moving it off any previous one.
    /// Binding to the current session again changes nothing.
    pub fn bind(&self, connection_id: Uuid, session_id: &str) -> LarderResult<()> {
        let previous = {
            let mut state = self.state.lock();
            let previous = match state.connections.get(&connection_id) {
                Some(conn) => conn.session_id.clone(),
                None => return Err(LarderError::NotFound(format!("connection {connection_id}"))),
            };
            if previous.as_deref() == Some(session_id) {
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.touch();
                }
                return Ok(());
            }
            if let Some(old) = previous.as_deref().and_then(|s| state.sessions.get_mut(s)) {
                old.connections.remove(&connection_id);
                old.touch();
            }
            let (session, _) = state.ensure_session(session_id);
            session.connections.insert(connection_id);
            session.touch();
            if let Some(conn) = state.connections.get_mut(&connection_id) {
                conn.session_id = Some(session_id.to_string());
            }
            previous
        };
        info!(
            connection_id = %connection_id,
            session_id = %session_id,
            previous = ?previous,
            "Connection bound"
        );
        Ok(())
    }

    /// Send `event` to every connection bound to `session_id`.
    ///
    /// Each connection gets its own send bounded by `send_timeout`, and all
    /// sends run concurrently. A connection that is closed, or whose buffer
    /// stays full for the whole timeout, is deregistered so its writer ends
    /// and the client reconnects instead of silently missing events.
    pub async fn deliver(&self, session_id: &str, event: Envelope) -> DeliveryReport {
        let targets: Vec<(Uuid, mpsc::Sender<Envelope>)> = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match state.sessions.get_mut(session_id) {
                Some(session) => {
                    session.touch();
                    session
                        .connections
                        .iter()
                        .filter_map(|id| state.connections.get(id).map(|c| (*id, c.tx.clone())))
                        .collect()
                }
                None => Vec::new(),
            }
        };

        let timeout = self.config.send_timeout;
        let sends = targets.into_iter().map(|(id, tx)| {
            let event = event.clone();
            async move { (id, tx.send_timeout(event, timeout).await) }
        });

        let mut report = DeliveryReport::new(session_id);
        let mut stalled = Vec::new();
        let mut closed = Vec::new();
        for (id, outcome) in join_all(sends).await {
            match outcome {
                Ok(()) => report.delivered.push(id),
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    report.failed.push(FailedDelivery {
                        connection_id: id,
                        reason: "outbound buffer full".into(),
                    });
                    stalled.push(id);
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    report.failed.push(FailedDelivery {
                        connection_id: id,
                        reason: "connection closed".into(),
                    });
                    closed.push(id);
                }
            }
        }
        for id in closed {
            self.deregister(id);
        }
        for id in stalled {
            if self.deregister(id) {
                self.counters.forced_disconnects.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.counters
            .delivered
            .fetch_add(report.delivered.len() as u64, Ordering::Relaxed);
        if !report.failed.is_empty() {
            self.counters
                .delivery_failures
                .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
            for failure in &report.failed {
                warn!(
                    session_id = %session_id,
                    connection_id = %failure.connection_id,
                    reason = %failure.reason,
                    "Delivery failed"
                );
            }
        }
        if report.attempted() == 0 {
            debug!(session_id = %session_id, event = ?event.event_type, "No connections to deliver to");
        }
        report
    }

    /// Send `event` to one connection, bound or not. Used for frame-level
    /// replies that belong to no session.
    pub fn send_to(&self, connection_id: Uuid, event: Envelope) -> LarderResult<()> {
        let tx = self
            .state
            .lock()
            .connections
            .get(&connection_id)
            .map(|c| c.tx.clone())
            .ok_or_else(|| LarderError::NotFound(format!("connection {connection_id}")))?;
        match tx.try_send(event) {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                if matches!(e, mpsc::error::TrySendError::Closed(_)) {
                    self.deregister(connection_id);
                }
                Err(LarderError::DeliveryFailure(format!(
                    "connection {connection_id}: {e}"
                )))
            }
        }
    }

    /// Remove a connection. Returns `false` if it was not registered.
    pub fn deregister(&self, connection_id: Uuid) -> bool {
        let removed = self.state.lock().detach(connection_id);
        match removed {
            Some(conn) => {
                self.counters.deregistered.fetch_add(1, Ordering::Relaxed);
                info!(connection_id = %connection_id, session_id = ?conn.session_id, "Connection removed");
                true
            }
            None => false,
        }
    }

    /// Record a heartbeat from the client.
    pub fn heartbeat(&self, connection_id: Uuid) -> LarderResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let conn = state
            .connections
            .get_mut(&connection_id)
            .ok_or_else(|| LarderError::NotFound(format!("connection {connection_id}")))?;
        conn.last_heartbeat = Instant::now();
        if let Some(session) = conn.session_id.as_deref().and_then(|s| state.sessions.get_mut(s)) {
            session.touch();
        }
        Ok(())
    }

    /// Force-close connections silent for longer than two heartbeat
    /// intervals as of `now`. Returns the removed ids.
    pub fn sweep(&self, now: Instant) -> Vec<Uuid> {
        let deadline = self.config.liveness_deadline();
        let removed: Vec<Connection> = {
            let mut state = self.state.lock();
            let stale: Vec<Uuid> = state
                .connections
                .values()
                .filter(|c| now.saturating_duration_since(c.last_heartbeat) > deadline)
                .map(|c| c.id)
                .collect();
            stale.into_iter().filter_map(|id| state.detach(id)).collect()
        };

        for conn in &removed {
            warn!(
                connection_id = %conn.id,
                session_id = ?conn.session_id,
                "Connection missed heartbeats, disconnecting"
            );
        }
        let n = removed.len() as u64;
        self.counters.forced_disconnects.fetch_add(n, Ordering::Relaxed);
        self.counters.deregistered.fetch_add(n, Ordering::Relaxed);
        removed.into_iter().map(|c| c.id).collect()
    }

    /// Send a server heartbeat to every open connection. Returns how many
    /// were sent. Full buffers are skipped; the client will catch up.
    pub fn heartbeat_all(&self) -> usize {
        let targets: Vec<(String, mpsc::Sender<Envelope>)> = self
            .state
            .lock()
            .connections
            .values()
            .map(|c| (c.session_id.clone().unwrap_or_default(), c.tx.clone()))
            .collect();
        targets
            .into_iter()
            .filter(|(session_id, tx)| tx.try_send(Envelope::heartbeat(session_id.as_str())).is_ok())
            .count()
    }

    /// Provision a session. Returns `true` if it was created.
    pub fn ensure_session(&self, session_id: &str) -> bool {
        let created = self.state.lock().ensure_session(session_id).1;
        if created {
            info!(session_id = %session_id, "Session created");
        }
        created
    }

    /// Remove a session and close every connection bound to it.
    pub fn remove_session(&self, session_id: &str) -> Option<Session> {
        let (session, closed) = {
            let mut state = self.state.lock();
            let session = state.sessions.remove(session_id)?;
            let closed: Vec<Connection> = session
                .connections
                .iter()
                .filter_map(|id| state.connections.remove(id))
                .collect();
            (session, closed)
        };
        self.counters
            .deregistered
            .fetch_add(closed.len() as u64, Ordering::Relaxed);
        info!(session_id = %session_id, connections = closed.len(), "Session removed");
        Some(session)
    }

    /// Drop sessions that have had no connections for the idle TTL.
    /// Returns the removed session ids.
    pub fn sweep_sessions(&self, now: Instant) -> Vec<String> {
        let ttl = self.config.session_idle_ttl;
        let expired: Vec<String> = {
            let mut state = self.state.lock();
            let expired: Vec<String> = state
                .sessions
                .values()
                .filter(|s| s.is_empty() && now.saturating_duration_since(s.last_seen) > ttl)
                .map(|s| s.id.clone())
                .collect();
            for id in &expired {
                state.sessions.remove(id);
            }
            expired
        };
        if !expired.is_empty() {
            self.counters
                .sessions_expired
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            info!(count = expired.len(), "Expired idle sessions");
        }
        expired
    }

    /// Snapshot of one session.
    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    /// Snapshot of one connection.
    pub fn connection(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.state
            .lock()
            .connections
            .get(&connection_id)
            .map(Connection::info)
    }

    /// Connection ids bound to `session_id`, in id order.
    pub fn connections_for(&self, session_id: &str) -> Vec<Uuid> {
        self.state
            .lock()
            .sessions
            .get(session_id)
            .map(|s| s.connections.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Open connections.
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Known sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Current gauges and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        let (connections, sessions) = {
            let state = self.state.lock();
            (state.connections.len(), state.sessions.len())
        };
        let c = &self.counters;
        PoolStats {
            connections,
            sessions,
            registered: c.registered.load(Ordering::Relaxed),
            deregistered: c.deregistered.load(Ordering::Relaxed),
            forced_disconnects: c.forced_disconnects.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            delivery_failures: c.delivery_failures.load(Ordering::Relaxed),
            sessions_expired: c.sessions_expired.load(Ordering::Relaxed),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[async_trait]
impl SessionBus for ConnectionPool {
    fn ensure_session(&self, session_id: &str) -> bool {
        ConnectionPool::ensure_session(self, session_id)
    }

    async fn deliver(&self, session_id: &str, event: Envelope) -> DeliveryReport {
        ConnectionPool::deliver(self, session_id, event).await
    }
}
