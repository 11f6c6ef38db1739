use crate::backend::{QueueBackend, QueueError, ReportSender, WorkerReport, REPORT_BUFFER};
use crate::job::JobRecord;
use crate::retry::RetryPolicy;
use larder_core::wire::check_payload;
use larder_core::{
    AgentInvocation, ErrorDescriptor, ErrorKind, InvocationStatus, LarderError, LarderResult,
    Payload,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Called once with a snapshot of the job.
pub type JobCallback = Box<dyn FnOnce(AgentInvocation) + Send>;

/// Adapter settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Backoff for a busy backend.
    pub retry: RetryPolicy,
    /// Terminal jobs kept for polling before the oldest are forgotten.
    pub retention: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            retention: 1024,
        }
    }
}

/// Point-in-time queue counters. All counters are monotonic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs accepted.
    pub submitted: u64,
    /// Jobs that succeeded.
    pub succeeded: u64,
    /// Jobs that failed.
    pub failed: u64,
    /// Jobs that timed out.
    pub timed_out: u64,
    /// Jobs cancelled.
    pub cancelled: u64,
    /// Submissions refused.
    pub rejected: u64,
    /// Redeliveries after a worker crash.
    pub redelivered: u64,
    /// Jobs given up after repeated crashes.
    pub dead_lettered: u64,
    /// Jobs accepted and not yet terminal.
    pub in_flight: usize,
    /// Jobs waiting for a worker.
    pub depth: usize,
    /// Records currently held, terminal ones included.
    pub retained: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

struct JobEntry {
    invocation: AgentInvocation,
    started: bool,
    on_start: Vec<JobCallback>,
    on_terminal: Vec<JobCallback>,
}

#[derive(Default)]
struct TableInner {
    jobs: HashMap<Uuid, JobEntry>,
    finished: VecDeque<Uuid>,
}

/// Every queued job record. All status changes go through here.
struct JobTable {
    inner: Mutex<TableInner>,
    retention: usize,
    counters: Counters,
}

impl JobTable {
    fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            retention,
            counters: Counters::default(),
        }
    }

    fn insert(&self, invocation: AgentInvocation) -> LarderResult<()> {
        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&invocation.id) {
            return Err(LarderError::InvalidMessage(format!(
                "job {} was already submitted",
                invocation.id
            )));
        }
        inner.jobs.insert(
            invocation.id,
            JobEntry {
                invocation,
                started: false,
                on_start: Vec::new(),
                on_terminal: Vec::new(),
            },
        );
        Ok(())
    }

    fn remove(&self, job_id: Uuid) {
        self.inner.lock().jobs.remove(&job_id);
    }

    fn get(&self, job_id: Uuid) -> Option<AgentInvocation> {
        self.inner
            .lock()
            .jobs
            .get(&job_id)
            .map(|e| e.invocation.clone())
    }

    fn mark_started(&self, job_id: Uuid) {
        let (callbacks, snapshot) = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "Start report for unknown job");
                return;
            };
            if !entry.invocation.mark_running() {
                debug!(job_id = %job_id, status = %entry.invocation.status, "Ignoring start report");
                return;
            }
            entry.started = true;
            (std::mem::take(&mut entry.on_start), entry.invocation.clone())
        };
        for callback in callbacks {
            callback(snapshot.clone());
        }
    }

    /// Apply a terminal outcome. Successful outputs are checked for wire
    /// safety first. Returns `false` if the job is unknown or already terminal.
    fn finish(&self, job_id: Uuid, outcome: Result<Payload, ErrorDescriptor>) -> bool {
        let outcome = match outcome {
            Ok(output) => match check_payload(&output) {
                Ok(()) => Ok(output),
                Err(e) => Err(ErrorDescriptor::new(
                    ErrorKind::SerializationError,
                    format!("agent output is not wire-safe: {}", e.message()),
                )),
            },
            Err(e) => Err(e),
        };

        let (callbacks, snapshot) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(entry) = inner.jobs.get_mut(&job_id) else {
                debug!(job_id = %job_id, "Terminal report for unknown job");
                return false;
            };
            let applied = match outcome {
                Ok(output) => entry.invocation.succeed(output),
                Err(err) => entry.invocation.fail(err),
            };
            if !applied {
                debug!(job_id = %job_id, status = %entry.invocation.status, "Ignoring late terminal report");
                return false;
            }
            entry.on_start.clear();
            let callbacks = std::mem::take(&mut entry.on_terminal);
            let snapshot = entry.invocation.clone();

            inner.finished.push_back(job_id);
            while inner.finished.len() > self.retention {
                if let Some(old) = inner.finished.pop_front() {
                    inner.jobs.remove(&old);
                }
            }
            (callbacks, snapshot)
        };

        self.count_terminal(&snapshot);
        for callback in callbacks {
            callback(snapshot.clone());
        }
        true
    }

    fn count_terminal(&self, invocation: &AgentInvocation) {
        let counter = match invocation.status {
            InvocationStatus::Succeeded => &self.counters.succeeded,
            InvocationStatus::TimedOut => &self.counters.timed_out,
            _ => match &invocation.error {
                Some(e) if e.error_kind() == ErrorKind::Cancelled => &self.counters.cancelled,
                _ => &self.counters.failed,
            },
        };
        counter.fetch_add(1, Ordering::Relaxed);
        info!(
            job_id = %invocation.id,
            agent = %invocation.agent,
            status = %invocation.status,
            "Job finished"
        );
    }

    fn apply(&self, report: WorkerReport) {
        match report {
            WorkerReport::Started { job_id } => self.mark_started(job_id),
            WorkerReport::Finished { job_id, outcome } => {
                self.finish(job_id, outcome);
            }
            WorkerReport::Redelivered { job_id, attempt } => {
                self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job_id, attempt, "Job redelivered after worker crash");
            }
            WorkerReport::DeadLettered { job_id, reason } => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                error!(job_id = %job_id, reason = %reason, "Job dead-lettered");
                self.finish(
                    job_id,
                    Err(ErrorDescriptor::new(
                        ErrorKind::AgentError,
                        format!("worker crashed repeatedly: {reason}"),
                    )),
                );
            }
        }
    }

    fn on_start(&self, job_id: Uuid, callback: JobCallback) -> LarderResult<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let entry = inner
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| LarderError::NotFound(format!("job {job_id}")))?;
            if !entry.started {
                if !entry.invocation.is_terminal() {
                    entry.on_start.push(callback);
                }
                return Ok(());
            }
            entry.invocation.clone()
        };
        callback(snapshot);
        Ok(())
    }

    fn on_terminal(&self, job_id: Uuid, callback: JobCallback) -> LarderResult<()> {
        let snapshot = {
            let mut inner = self.inner.lock();
            let entry = inner
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| LarderError::NotFound(format!("job {job_id}")))?;
            if !entry.invocation.is_terminal() {
                entry.on_terminal.push(callback);
                return Ok(());
            }
            entry.invocation.clone()
        };
        callback(snapshot);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|e| !e.invocation.is_terminal())
            .count()
    }

    fn retained(&self) -> usize {
        self.inner.lock().jobs.len()
    }
}

async fn collect(table: Arc<JobTable>, mut reports: mpsc::Receiver<WorkerReport>) {
    while let Some(report) = reports.recv().await {
        table.apply(report);
    }
    debug!("Worker report channel closed, collector stopping");
}

/// Submits invocations to a [`QueueBackend`] and tracks them to completion.
///
/// The adapter owns every queued job record. Workers never touch records
/// directly; they send [`WorkerReport`]s to a collector task that applies
/// them, and callers observe progress through [`poll`](Self::poll),
/// [`on_start`](Self::on_start) and [`subscribe`](Self::subscribe).
pub struct TaskQueueAdapter {
    table: Arc<JobTable>,
    backend: Arc<dyn QueueBackend>,
    retry: RetryPolicy,
    collector: JoinHandle<()>,
}

impl TaskQueueAdapter {
    /// Build the backend around a fresh report channel and start the
    /// collector. Must be called inside a tokio runtime.
    pub fn start<B, F>(config: AdapterConfig, build: F) -> Self
    where
        F: FnOnce(ReportSender) -> B,
        B: QueueBackend + 'static,
    {
        let (tx, rx) = mpsc::channel(REPORT_BUFFER);
        let backend: Arc<dyn QueueBackend> = Arc::new(build(tx));
        let table = Arc::new(JobTable::new(config.retention));
        let collector = tokio::spawn(collect(table.clone(), rx));
        Self {
            table,
            backend,
            retry: config.retry,
            collector,
        }
    }

    /// Record `invocation` as queued and hand it to the backend.
    ///
    /// The job id is the invocation id. Inputs that are not wire-safe are
    /// refused before anything is recorded. Transient backend errors are
    /// retried with backoff; when the budget is spent the record is dropped
    /// and [`LarderError::QueueUnavailable`] is returned.
    pub async fn submit(&self, invocation: AgentInvocation) -> LarderResult<Uuid> {
        check_payload(&invocation.input)?;
        if invocation.status != InvocationStatus::Queued {
            return Err(LarderError::InvalidMessage(format!(
                "job {} is already {}",
                invocation.id, invocation.status
            )));
        }

        let job_id = invocation.id;
        let record = JobRecord::from(&invocation);
        self.table.insert(invocation)?;
        self.table.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let attempts = self.retry.attempts();
        let mut last_error = String::new();
        for attempt in 0..attempts {
            match self.backend.enqueue(record.clone()).await {
                Ok(()) => {
                    info!(job_id = %job_id, agent = %record.agent, attempt, "Job enqueued");
                    return Ok(job_id);
                }
                Err(QueueError::Rejected(reason)) => {
                    warn!(job_id = %job_id, reason = %reason, "Job rejected by backend");
                    self.table.remove(job_id);
                    self.table.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(LarderError::QueueUnavailable(format!(
                        "job {job_id} rejected: {reason}"
                    )));
                }
                Err(QueueError::Unavailable(reason)) => {
                    if attempt + 1 < attempts {
                        let delay = self.retry.backoff(attempt);
                        warn!(
                            job_id = %job_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            reason = %reason,
                            "Queue unavailable, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    last_error = reason;
                }
            }
        }

        error!(job_id = %job_id, attempts, reason = %last_error, "Giving up on enqueue");
        self.table.remove(job_id);
        self.table.counters.rejected.fetch_add(1, Ordering::Relaxed);
        Err(LarderError::QueueUnavailable(format!(
            "gave up after {attempts} attempts: {last_error}"
        )))
    }

    /// Current record for `job_id`.
    pub fn poll(&self, job_id: Uuid) -> LarderResult<AgentInvocation> {
        self.table
            .get(job_id)
            .ok_or_else(|| LarderError::NotFound(format!("job {job_id}")))
    }

    /// Fire `callback` exactly once when the job reaches a terminal state,
    /// or immediately if it already has.
    pub fn subscribe<F>(&self, job_id: Uuid, callback: F) -> LarderResult<()>
    where
        F: FnOnce(AgentInvocation) + Send + 'static,
    {
        self.table.on_terminal(job_id, Box::new(callback))
    }

    /// Fire `callback` once when a worker picks the job up, or immediately
    /// if it already has. Never fires for a job that finished without
    /// starting.
    pub fn on_start<F>(&self, job_id: Uuid, callback: F) -> LarderResult<()>
    where
        F: FnOnce(AgentInvocation) + Send + 'static,
    {
        self.table.on_start(job_id, Box::new(callback))
    }

    /// Finish the job as failed with kind `cancelled` and ask the backend to
    /// stop it. Returns `false` if the job was already terminal.
    pub async fn cancel(&self, job_id: Uuid) -> LarderResult<bool> {
        self.terminate(
            job_id,
            ErrorDescriptor::new(ErrorKind::Cancelled, format!("job {job_id} was cancelled")),
        )
        .await
    }

    /// Finish the job as timed out because the caller stopped waiting.
    pub async fn expire(&self, job_id: Uuid, message: impl Into<String>) -> LarderResult<bool> {
        self.terminate(job_id, ErrorDescriptor::new(ErrorKind::Timeout, message))
            .await
    }

    async fn terminate(&self, job_id: Uuid, error: ErrorDescriptor) -> LarderResult<bool> {
        if self.table.get(job_id).is_none() {
            return Err(LarderError::NotFound(format!("job {job_id}")));
        }
        if !self.table.finish(job_id, Err(error)) {
            return Ok(false);
        }
        if !self.backend.cancel(job_id).await {
            debug!(job_id = %job_id, "Backend no longer held the job");
        }
        Ok(true)
    }

    /// Jobs waiting for a worker.
    pub fn depth(&self) -> usize {
        self.backend.depth()
    }

    /// Jobs not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.table.in_flight()
    }

    /// Lifetime counters.
    pub fn stats(&self) -> QueueStats {
        let c = &self.table.counters;
        QueueStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            in_flight: self.table.in_flight(),
            depth: self.backend.depth(),
            retained: self.table.retained(),
        }
    }
}

impl Drop for TaskQueueAdapter {
    fn drop(&mut self) {
        self.collector.abort();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    #[derive(Default)]
    struct Shared {
        fail_times: AtomicUsize,
        attempts: AtomicUsize,
        reject: AtomicBool,
        enqueued: Mutex<Vec<JobRecord>>,
        cancelled: Mutex<Vec<Uuid>>,
        reports: Mutex<Option<ReportSender>>,
    }

    struct MockBackend(Arc<Shared>);

    #[async_trait]
    impl QueueBackend for MockBackend {
        async fn enqueue(&self, job: JobRecord) -> Result<(), QueueError> {
            self.0.attempts.fetch_add(1, Ordering::SeqCst);
            if self.0.reject.load(Ordering::SeqCst) {
                return Err(QueueError::Rejected("agent unknown to workers".into()));
            }
            let remaining = self.0.fail_times.load(Ordering::SeqCst);
            if remaining > 0 {
                self.0.fail_times.store(remaining - 1, Ordering::SeqCst);
                return Err(QueueError::Unavailable("broker down".into()));
            }
            self.0.enqueued.lock().push(job);
            Ok(())
        }

        async fn cancel(&self, job_id: Uuid) -> bool {
            self.0.cancelled.lock().push(job_id);
            true
        }

        fn depth(&self) -> usize {
            self.0.enqueued.lock().len()
        }
    }

    fn adapter_with(config: AdapterConfig) -> (TaskQueueAdapter, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        let handle = shared.clone();
        let adapter = TaskQueueAdapter::start(config, move |tx| {
            *handle.reports.lock() = Some(tx);
            MockBackend(handle)
        });
        (adapter, shared)
    }

    fn adapter() -> (TaskQueueAdapter, Arc<Shared>) {
        adapter_with(AdapterConfig::default())
    }

    fn invocation(text: &str) -> AgentInvocation {
        AgentInvocation::new("delay", json!({"text": text}).as_object().cloned().unwrap())
    }

    fn output(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    async fn report(shared: &Shared, report: WorkerReport) {
        let tx = shared.reports.lock().clone().unwrap();
        tx.send(report).await.unwrap();
    }

    async fn wait_for(adapter: &TaskQueueAdapter, job_id: Uuid, status: InvocationStatus) {
        for _ in 0..200 {
            if matches!(adapter.poll(job_id), Ok(inv) if inv.status == status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    #[tokio::test]
    async fn test_submit_records_queued_job() {
        let (adapter, shared) = adapter();
        let inv = invocation("soup");
        let id = adapter.submit(inv.clone()).await.unwrap();
        assert_eq!(id, inv.id);
        assert_eq!(adapter.poll(id).unwrap().status, InvocationStatus::Queued);
        assert_eq!(shared.enqueued.lock()[0].job_id, id);
        assert_eq!(adapter.stats().submitted, 1);
        assert_eq!(adapter.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_unsafe_input_refused_before_recording() {
        let (adapter, shared) = adapter();
        let mut inv = invocation("soup");
        inv.input.insert("note".into(), Value::Null);
        let err = adapter.submit(inv.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SerializationError);
        assert!(shared.enqueued.lock().is_empty());
        assert_eq!(adapter.poll(inv.id).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let (adapter, shared) = adapter();
        shared.fail_times.store(2, Ordering::SeqCst);
        let id = adapter.submit(invocation("soup")).await.unwrap();
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(adapter.poll(id).unwrap().status, InvocationStatus::Queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_queue_unavailable() {
        let (adapter, shared) = adapter();
        shared.fail_times.store(usize::MAX, Ordering::SeqCst);
        let inv = invocation("soup");
        let err = adapter.submit(inv.clone()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueUnavailable);
        assert_eq!(
            shared.attempts.load(Ordering::SeqCst),
            RetryPolicy::default().max_attempts as usize
        );
        assert!(adapter.poll(inv.id).is_err());
        assert_eq!(adapter.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (adapter, shared) = adapter();
        shared.reject.store(true, Ordering::SeqCst);
        let err = adapter.submit(invocation("soup")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueUnavailable);
        assert_eq!(shared.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callbacks_fire_once_in_order() {
        let (adapter, shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        adapter
            .on_start(id, move |inv| s.lock().push(inv.status))
            .unwrap();
        let s = seen.clone();
        adapter
            .subscribe(id, move |inv| s.lock().push(inv.status))
            .unwrap();

        report(&shared, WorkerReport::Started { job_id: id }).await;
        report(
            &shared,
            WorkerReport::Finished {
                job_id: id,
                outcome: Ok(output(json!({"text": "soup"}))),
            },
        )
        .await;
        report(
            &shared,
            WorkerReport::Finished {
                job_id: id,
                outcome: Ok(output(json!({"text": "again"}))),
            },
        )
        .await;
        wait_for(&adapter, id, InvocationStatus::Succeeded).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *seen.lock(),
            vec![InvocationStatus::Running, InvocationStatus::Succeeded]
        );
        assert_eq!(adapter.poll(id).unwrap().result.unwrap()["text"], "soup");
        assert_eq!(adapter.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn test_subscribe_after_terminal_fires_immediately() {
        let (adapter, shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();
        report(&shared, WorkerReport::Started { job_id: id }).await;
        report(
            &shared,
            WorkerReport::Finished {
                job_id: id,
                outcome: Err(ErrorDescriptor::new(ErrorKind::AgentError, "no leeks")),
            },
        )
        .await;
        wait_for(&adapter, id, InvocationStatus::Failed).await;

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        adapter
            .subscribe(id, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let f = fired.clone();
        adapter
            .on_start(id, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unsafe_output_becomes_serialization_error() {
        let (adapter, shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();
        let mut out = Payload::new();
        out.insert("huge".into(), json!(u64::MAX));
        report(&shared, WorkerReport::Started { job_id: id }).await;
        report(
            &shared,
            WorkerReport::Finished {
                job_id: id,
                outcome: Ok(out),
            },
        )
        .await;
        wait_for(&adapter, id, InvocationStatus::Failed).await;
        let inv = adapter.poll(id).unwrap();
        assert_eq!(inv.error.unwrap().kind, "serialization_error");
        assert!(inv.result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_wins_over_late_result() {
        let (adapter, shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        adapter
            .subscribe(id, move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(adapter.cancel(id).await.unwrap());
        assert!(!adapter.cancel(id).await.unwrap());
        assert_eq!(*shared.cancelled.lock(), vec![id]);

        report(
            &shared,
            WorkerReport::Finished {
                job_id: id,
                outcome: Ok(output(json!({"text": "late"}))),
            },
        )
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let inv = adapter.poll(id).unwrap();
        assert_eq!(inv.status, InvocationStatus::Failed);
        assert_eq!(inv.error.unwrap().kind, "cancelled");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.stats().cancelled, 1);
    }

    #[tokio::test]
    async fn test_expire_marks_timed_out() {
        let (adapter, _shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();
        assert!(adapter.expire(id, "waited 3s").await.unwrap());
        let inv = adapter.poll(id).unwrap();
        assert_eq!(inv.status, InvocationStatus::TimedOut);
        assert_eq!(adapter.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_dead_letter_fails_with_agent_error() {
        let (adapter, shared) = adapter();
        let id = adapter.submit(invocation("soup")).await.unwrap();
        report(&shared, WorkerReport::Started { job_id: id }).await;
        report(&shared, WorkerReport::Redelivered { job_id: id, attempt: 1 }).await;
        report(
            &shared,
            WorkerReport::DeadLettered {
                job_id: id,
                reason: "panicked".into(),
            },
        )
        .await;
        wait_for(&adapter, id, InvocationStatus::Failed).await;
        let stats = adapter.stats();
        assert_eq!(stats.redelivered, 1);
        assert_eq!(stats.dead_lettered, 1);
        assert_eq!(adapter.poll(id).unwrap().error.unwrap().kind, "agent_error");
    }

    #[tokio::test]
    async fn test_retention_forgets_oldest_terminal_jobs() {
        let (adapter, _shared) = adapter_with(AdapterConfig {
            retention: 2,
            ..AdapterConfig::default()
        });
        let mut ids = Vec::new();
        for i in 0..3 {
            let id = adapter.submit(invocation(&format!("job {i}"))).await.unwrap();
            adapter.cancel(id).await.unwrap();
            ids.push(id);
        }
        assert!(adapter.poll(ids[0]).is_err());
        assert!(adapter.poll(ids[1]).is_ok());
        assert!(adapter.poll(ids[2]).is_ok());
        assert_eq!(adapter.stats().retained, 2);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let (adapter, _shared) = adapter();
        let id = Uuid::new_v4();
        assert_eq!(adapter.poll(id).unwrap_err().kind(), ErrorKind::NotFound);
        assert!(adapter.subscribe(id, |_| {}).is_err());
        assert!(adapter.cancel(id).await.is_err());
    }
}
