#![allow(clippy::unwrap_used, clippy::expect_used)]

use larder_agents::{register_builtins, AgentRegistry, BuiltinKind};
use larder_core::{AgentInvocation, InvocationStatus, Payload};
use larder_queue::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn registry() -> Arc<AgentRegistry> {
    Arc::new(
        register_builtins(AgentRegistry::builder())
            .register(
                BuiltinKind::Delay
                    .descriptor("slow_cook")
                    .timeout(Duration::from_millis(100)),
            )
            .build()
            .unwrap(),
    )
}

fn lazy_adapter(registry: Arc<AgentRegistry>) -> TaskQueueAdapter {
    TaskQueueAdapter::start(AdapterConfig::default(), move |reports| {
        LazyBackend::new(move || {
            Ok(InProcessQueue::new(
                registry.clone(),
                InProcessConfig::default(),
                reports.clone(),
            ))
        })
    })
}

fn input(v: serde_json::Value) -> Payload {
    v.as_object().cloned().unwrap()
}

async fn wait_terminal(adapter: &TaskQueueAdapter, invocation: AgentInvocation) -> AgentInvocation {
    let (tx, rx) = oneshot::channel();
    let id = adapter.submit(invocation).await.unwrap();
    adapter
        .subscribe(id, move |inv| {
            let _ = tx.send(inv);
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap()
}

// ---------------------------------------------------------------------------
// 1. A long-running job goes queued -> running -> succeeded
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delay_job_succeeds() {
    let adapter = lazy_adapter(registry());
    let done = wait_terminal(
        &adapter,
        AgentInvocation::new("sleep", input(json!({"text": "stew", "delay_ms": 20}))),
    )
    .await;

    assert_eq!(done.status, InvocationStatus::Succeeded);
    let result = done.result.unwrap();
    assert_eq!(result["text"], "stew");
    assert_eq!(result["delayed_ms"], 20);

    let stats = adapter.stats();
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.in_flight, 0);
}

// ---------------------------------------------------------------------------
// 2. A 100ms agent timeout against 1s of work finishes as timed-out
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_timeout_finishes_timed_out() {
    let adapter = lazy_adapter(registry());
    let started = tokio::time::Instant::now();
    let done = wait_terminal(
        &adapter,
        AgentInvocation::new("slow_cook", input(json!({"text": "braise", "delay_ms": 1_000}))),
    )
    .await;

    assert_eq!(done.status, InvocationStatus::TimedOut);
    assert_eq!(done.error.unwrap().kind, "timeout");
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(adapter.stats().timed_out, 1);
}

// ---------------------------------------------------------------------------
// 3. Agent failures are reduced to wire descriptors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_error_is_reported() {
    let adapter = lazy_adapter(registry());
    let done = wait_terminal(
        &adapter,
        AgentInvocation::new("fail", input(json!({"text": "x"}))),
    )
    .await;
    assert_eq!(done.status, InvocationStatus::Failed);
    assert_eq!(done.error.unwrap().kind, "agent_error");
}

// ---------------------------------------------------------------------------
// 4. Cancelling a running job finishes it once as cancelled
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_running_job() {
    let adapter = lazy_adapter(registry());
    let inv = AgentInvocation::new("delay", input(json!({"text": "x", "delay_ms": 60_000})));
    let id = adapter.submit(inv).await.unwrap();

    let (started_tx, started_rx) = oneshot::channel();
    adapter
        .on_start(id, move |_| {
            let _ = started_tx.send(());
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), started_rx)
        .await
        .unwrap()
        .unwrap();

    assert!(adapter.cancel(id).await.unwrap());
    let inv = adapter.poll(id).unwrap();
    assert_eq!(inv.status, InvocationStatus::Failed);
    assert_eq!(inv.error.unwrap().kind, "cancelled");
    assert_eq!(adapter.stats().cancelled, 1);
}
