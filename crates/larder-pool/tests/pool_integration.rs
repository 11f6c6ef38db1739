#![allow(clippy::unwrap_used, clippy::expect_used)]

use larder_core::{Envelope, EventType, InvocationStatus, SessionBus};
use larder_pool::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const N: usize = 4;

enum Fault {
    Healthy,
    Closed,
    Full,
}

fn fault_for(mask: u32, index: usize) -> Fault {
    if mask & (1 << index) == 0 {
        Fault::Healthy
    } else if index % 2 == 0 {
        Fault::Closed
    } else {
        Fault::Full
    }
}

// ---------------------------------------------------------------------------
// 1. For every subset of failing connections, the rest still get the event
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn delivery_isolation_over_every_failing_subset() {
    for mask in 0..(1u32 << N) {
        let pool = ConnectionPool::new(PoolConfig {
            buffer: 1,
            ..PoolConfig::default()
        });

        let mut healthy = BTreeSet::new();
        let mut failing = BTreeSet::new();
        let mut closed = BTreeSet::new();
        let mut stalled = BTreeSet::new();
        let mut receivers = Vec::new();

        for index in 0..N {
            let (tx, rx) = mpsc::channel(1);
            let conn = Connection::new(tx.clone()).with_session("S1");
            let id = conn.id;
            pool.register(conn).unwrap();
            match fault_for(mask, index) {
                Fault::Healthy => {
                    healthy.insert(id);
                    receivers.push((id, rx));
                }
                Fault::Closed => {
                    failing.insert(id);
                    closed.insert(id);
                    drop(rx);
                }
                Fault::Full => {
                    failing.insert(id);
                    stalled.insert(id);
                    tx.try_send(Envelope::heartbeat("S1")).unwrap();
                    receivers.push((id, rx));
                }
            }
        }

        let event = Envelope::status("S1", Uuid::new_v4(), InvocationStatus::Running);
        let report = pool.deliver("S1", event.clone()).await;

        let delivered: BTreeSet<Uuid> = report.delivered.iter().copied().collect();
        let failed: BTreeSet<Uuid> = report.failed.iter().map(|f| f.connection_id).collect();
        assert_eq!(delivered, healthy, "mask {mask:04b}");
        assert_eq!(failed, failing, "mask {mask:04b}");

        for (id, mut rx) in receivers {
            let first = rx.try_recv().unwrap();
            if healthy.contains(&id) {
                assert_eq!(first, event, "mask {mask:04b}");
            } else {
                assert_eq!(first.event_type, EventType::Heartbeat);
                assert!(rx.try_recv().is_err());
            }
        }

        assert_eq!(pool.connection_count(), healthy.len(), "mask {mask:04b}");
        for id in closed.iter().chain(&stalled) {
            assert!(pool.connection(*id).is_none(), "mask {mask:04b}");
        }
        assert_eq!(pool.connections_for("S1").len(), healthy.len());
        assert_eq!(pool.stats().forced_disconnects, stalled.len() as u64);
    }
}

// ---------------------------------------------------------------------------
// 2. Events reach each connection in production order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_connection_fifo() {
    let pool = ConnectionPool::default();
    let (conn, mut rx) = Connection::open(64);
    pool.register(conn.with_session("S1")).unwrap();

    let id = Uuid::new_v4();
    let events = vec![
        Envelope::status("S1", id, InvocationStatus::Queued),
        Envelope::status("S1", id, InvocationStatus::Running),
        Envelope::result("S1", id, Default::default()),
    ];
    for event in &events {
        pool.deliver("S1", event.clone()).await;
    }
    for expected in &events {
        assert_eq!(&rx.recv().await.unwrap(), expected);
    }
}

// ---------------------------------------------------------------------------
// 3. The pool serves as the orchestrator's session bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pool_as_session_bus() {
    let pool = Arc::new(ConnectionPool::default());
    let bus: Arc<dyn SessionBus> = pool.clone();

    assert!(bus.ensure_session("S1"));
    assert!(!bus.ensure_session("S1"));

    let (conn, mut rx) = Connection::open(4);
    let conn_id = conn.id;
    pool.register(conn).unwrap();
    pool.bind(conn_id, "S1").unwrap();

    let report = bus.deliver("S1", Envelope::heartbeat("S1")).await;
    assert_eq!(report.delivered, vec![conn_id]);
    assert!(rx.recv().await.is_some());
}

// ---------------------------------------------------------------------------
// 4. Concurrent register/bind/deregister keeps the indices consistent
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_churn_keeps_indices_consistent() {
    let pool = Arc::new(ConnectionPool::default());
    let mut tasks = Vec::new();
    for t in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            let mut kept = Vec::new();
            for i in 0..50 {
                let (conn, rx) = Connection::open(4);
                let id = conn.id;
                pool.register(conn).unwrap();
                pool.bind(id, &format!("S{}", (t + i) % 5)).unwrap();
                if i % 3 == 0 {
                    assert!(pool.deregister(id));
                } else {
                    kept.push(rx);
                }
            }
            kept
        }));
    }
    let mut receivers = Vec::new();
    for task in tasks {
        receivers.extend(task.await.unwrap());
    }

    let bound: usize = (0..5)
        .map(|s| pool.connections_for(&format!("S{s}")).len())
        .sum();
    assert_eq!(bound, pool.connection_count());
    assert_eq!(pool.connection_count(), receivers.len());
}
