use chrono::{DateTime, Utc};
use larder_orchestrator::Orchestrator;
use larder_pool::ConnectionPool;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Pool and dispatch health at one point in time. Counters only grow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMetricsSnapshot {
    /// When the snapshot was computed.
    pub taken_at: DateTime<Utc>,
    /// Open connections.
    pub active_connections: usize,
    /// Known sessions.
    pub active_sessions: usize,
    /// Invocations not yet terminal.
    pub jobs_in_flight: usize,
    /// Jobs waiting for a worker.
    pub queue_depth: usize,
    /// Invocations that succeeded.
    pub succeeded: u64,
    /// Invocations that failed.
    pub failed: u64,
    /// Invocations that timed out.
    pub timed_out: u64,
    /// Invocations cancelled.
    pub cancelled: u64,
    /// Events handed to connections.
    pub delivered: u64,
    /// Events not handed over.
    pub delivery_failures: u64,
    /// Connections dropped by the pool.
    pub forced_disconnects: u64,
    /// Idle sessions removed.
    pub sessions_expired: u64,
    /// Queue redeliveries after a worker crash.
    pub redelivered: u64,
    /// Jobs given up after repeated crashes.
    pub dead_lettered: u64,
}

/// Aggregator settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// How stale a served snapshot may be.
    pub freshness: Duration,
    /// Samples kept by [`MetricsAggregator::record`].
    pub history: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(1),
            history: 120,
        }
    }
}

/// Reads the pool, the orchestrator and the queue into
/// [`PoolMetricsSnapshot`]s.
pub struct MetricsAggregator {
    pool: Arc<ConnectionPool>,
    orchestrator: Arc<Orchestrator>,
    config: MetricsConfig,
    cached: Mutex<Option<(Instant, PoolMetricsSnapshot)>>,
    history: Mutex<VecDeque<PoolMetricsSnapshot>>,
}

impl MetricsAggregator {
    /// Aggregator over the pool and orchestrator.
    pub fn new(pool: Arc<ConnectionPool>, orchestrator: Arc<Orchestrator>, config: MetricsConfig) -> Self {
        Self {
            pool,
            orchestrator,
            config,
            cached: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Aggregator settings.
    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }

    /// A snapshot no older than the freshness window.
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        let mut cached = self.cached.lock();
        if let Some((at, snapshot)) = cached.as_ref() {
            if at.elapsed() <= self.config.freshness {
                return snapshot.clone();
            }
        }
        let snapshot = self.collect();
        *cached = Some((Instant::now(), snapshot.clone()));
        snapshot
    }

    /// Take a fresh sample and append it to the history ring.
    pub fn record(&self) -> PoolMetricsSnapshot {
        let snapshot = self.collect();
        *self.cached.lock() = Some((Instant::now(), snapshot.clone()));

        let mut history = self.history.lock();
        history.push_back(snapshot.clone());
        while history.len() > self.config.history.max(1) {
            history.pop_front();
        }
        snapshot
    }

    /// Recorded samples, oldest first.
    pub fn history(&self) -> Vec<PoolMetricsSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    /// Call [`record`](Self::record) every `interval` until aborted.
    pub fn spawn_sampler(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let sample = self.record();
                debug!(
                    connections = sample.active_connections,
                    in_flight = sample.jobs_in_flight,
                    "Metrics sampled"
                );
            }
        })
    }

    fn collect(&self) -> PoolMetricsSnapshot {
        let pool = self.pool.stats();
        let invocations = self.orchestrator.stats();
        let queue = self.orchestrator.queue().map(|q| q.stats()).unwrap_or_default();
        PoolMetricsSnapshot {
            taken_at: Utc::now(),
            active_connections: pool.connections,
            active_sessions: pool.sessions,
            jobs_in_flight: invocations.in_flight,
            queue_depth: queue.depth,
            succeeded: invocations.succeeded,
            failed: invocations.failed,
            timed_out: invocations.timed_out,
            cancelled: invocations.cancelled,
            delivered: pool.delivered,
            delivery_failures: pool.delivery_failures,
            forced_disconnects: pool.forced_disconnects,
            sessions_expired: pool.sessions_expired,
            redelivered: queue.redelivered,
            dead_lettered: queue.dead_lettered,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use larder_agents::{register_builtins, AgentRegistry};
    use larder_core::SessionBus;
    use larder_orchestrator::OrchestratorConfig;
    use larder_pool::{Connection, PoolConfig};

    fn aggregator(history: usize) -> (Arc<ConnectionPool>, Arc<Orchestrator>, MetricsAggregator) {
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        let registry = Arc::new(
            register_builtins(AgentRegistry::builder())
                .default_agent("echo")
                .build()
                .unwrap(),
        );
        let bus: Arc<dyn SessionBus> = pool.clone();
        let orchestrator = Arc::new(Orchestrator::new(registry, bus, OrchestratorConfig::default()).unwrap());
        let metrics = MetricsAggregator::new(
            pool.clone(),
            orchestrator.clone(),
            MetricsConfig {
                history,
                ..MetricsConfig::default()
            },
        );
        (pool, orchestrator, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_is_cached_within_freshness() {
        let (pool, _orch, metrics) = aggregator(4);
        assert_eq!(metrics.snapshot().active_connections, 0);

        let (conn, _rx) = Connection::open(4);
        pool.register(conn.with_session("S1")).unwrap();
        assert_eq!(metrics.snapshot().active_connections, 0);

        tokio::time::advance(Duration::from_millis(1_100)).await;
        let fresh = metrics.snapshot();
        assert_eq!(fresh.active_connections, 1);
        assert_eq!(fresh.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_counters_follow_queries() {
        let (_pool, orch, metrics) = aggregator(4);
        orch.process_query("one", "S1").await.unwrap();
        orch.process_query("two", "S1").await.unwrap();

        let sample = metrics.record();
        assert_eq!(sample.succeeded, 2);
        assert_eq!(sample.jobs_in_flight, 0);
        assert_eq!(metrics.history(), vec![sample]);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (_pool, _orch, metrics) = aggregator(3);
        for _ in 0..5 {
            metrics.record();
        }
        let history = metrics.history();
        assert_eq!(history.len(), 3);
        assert!(history.windows(2).all(|w| w[0].taken_at <= w[1].taken_at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_records_periodically() {
        let (_pool, _orch, metrics) = aggregator(10);
        let metrics = Arc::new(metrics);
        let handle = metrics.clone().spawn_sampler(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(16)).await;
        handle.abort();
        assert_eq!(metrics.history().len(), 3);
    }
}
