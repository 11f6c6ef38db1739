use crate::backend::{QueueBackend, QueueError, ReportSender, WorkerReport};
use crate::job::JobRecord;
use async_trait::async_trait;
use larder_agents::{AgentContext, AgentOverrides, AgentRegistry};
use larder_core::{ErrorDescriptor, ErrorKind, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProcessConfig {
    /// Worker tasks draining the channel.
    pub workers: usize,
    /// Jobs that may wait for a worker before enqueue reports the queue full.
    pub capacity: usize,
    /// How many times a job whose worker crashed is run again.
    pub max_redeliveries: u32,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 256,
            max_redeliveries: 2,
        }
    }
}

/// Where each live job is. A job id is in exactly one of `pending`,
/// `claimed` or `running` until its worker is done with it, and
/// `cancelled` only ever holds ids from those sets.
#[derive(Default)]
struct Tracking {
    /// Accepted, still waiting in the channel.
    pending: HashSet<Uuid>,
    /// Picked up by a worker, no task running right now.
    claimed: HashSet<Uuid>,
    running: HashMap<Uuid, AbortHandle>,
    /// Cancel requests for pending or claimed jobs.
    cancelled: HashSet<Uuid>,
}

impl Tracking {
    /// Move a job from the channel to a worker. Returns `false` if it was
    /// cancelled while waiting.
    fn claim(&mut self, job_id: Uuid) -> bool {
        self.pending.remove(&job_id);
        if self.cancelled.remove(&job_id) {
            return false;
        }
        self.claimed.insert(job_id);
        true
    }

    /// Record the running task. Returns `false` (and aborts it) if a cancel
    /// arrived after the job was claimed.
    fn start(&mut self, job_id: Uuid, handle: AbortHandle) -> bool {
        self.claimed.remove(&job_id);
        if self.cancelled.remove(&job_id) {
            handle.abort();
            return false;
        }
        self.running.insert(job_id, handle);
        true
    }

    /// The task ended; the worker may still redeliver.
    fn stop(&mut self, job_id: Uuid) {
        if self.running.remove(&job_id).is_some() {
            self.claimed.insert(job_id);
        }
    }

    /// The worker is done with the job for good.
    fn release(&mut self, job_id: Uuid) {
        self.claimed.remove(&job_id);
        self.running.remove(&job_id);
        self.cancelled.remove(&job_id);
    }
}

struct WorkerShared {
    registry: Arc<AgentRegistry>,
    reports: ReportSender,
    max_redeliveries: u32,
    tracking: Mutex<Tracking>,
}

/// A bounded in-memory job channel drained by a fixed set of worker tasks.
///
/// Each job runs in its own task so a panicking agent is caught and the job
/// redelivered instead of taking the worker down.
pub struct InProcessQueue {
    jobs: mpsc::Sender<JobRecord>,
    shared: Arc<WorkerShared>,
    workers: Vec<JoinHandle<()>>,
}

impl InProcessQueue {
    /// Spawn `config.workers` workers. Must be called inside a tokio runtime.
    pub fn new(registry: Arc<AgentRegistry>, config: InProcessConfig, reports: ReportSender) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(WorkerShared {
            registry,
            reports,
            max_redeliveries: config.max_redeliveries,
            tracking: Mutex::new(Tracking::default()),
        });

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(worker_loop(index, rx.clone(), shared.clone())))
            .collect::<Vec<_>>();
        info!(
            workers = workers.len(),
            capacity = config.capacity,
            "In-process queue started"
        );

        Self {
            jobs: tx,
            shared,
            workers,
        }
    }

    /// Number of worker tasks.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.shared.tracking.lock().running.len()
    }

    /// Cancel requests not yet consumed by a worker.
    pub fn pending_cancels(&self) -> usize {
        self.shared.tracking.lock().cancelled.len()
    }
}

impl Drop for InProcessQueue {
    fn drop(&mut self) {
        for handle in self.shared.tracking.lock().running.values() {
            handle.abort();
        }
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[async_trait]
impl QueueBackend for InProcessQueue {
    async fn enqueue(&self, job: JobRecord) -> Result<(), QueueError> {
        let job_id = job.job_id;
        self.shared.tracking.lock().pending.insert(job_id);
        self.jobs.try_send(job).map_err(|e| {
            let mut tracking = self.shared.tracking.lock();
            tracking.pending.remove(&job_id);
            tracking.cancelled.remove(&job_id);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    QueueError::Unavailable(format!("queue full, job {job_id} not accepted"))
                }
                mpsc::error::TrySendError::Closed(_) => {
                    QueueError::Unavailable("workers have stopped".into())
                }
            }
        })
    }

    async fn cancel(&self, job_id: Uuid) -> bool {
        let mut tracking = self.shared.tracking.lock();
        if let Some(handle) = tracking.running.remove(&job_id) {
            handle.abort();
            debug!(job_id = %job_id, "Aborted running job");
            return true;
        }
        if tracking.pending.contains(&job_id) || tracking.claimed.contains(&job_id) {
            tracking.cancelled.insert(job_id);
            debug!(job_id = %job_id, "Job will be skipped");
            return true;
        }
        false
    }

    fn depth(&self) -> usize {
        self.jobs.max_capacity() - self.jobs.capacity()
    }
}

async fn worker_loop(
    index: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<JobRecord>>>,
    shared: Arc<WorkerShared>,
) {
    loop {
        let next = { jobs.lock().await.recv().await };
        let Some(job) = next else {
            debug!(worker = index, "Job channel closed, worker stopping");
            return;
        };
        process(index, &shared, job).await;
    }
}

async fn process(index: usize, shared: &Arc<WorkerShared>, job: JobRecord) {
    let job_id = job.job_id;
    if !shared.tracking.lock().claim(job_id) {
        debug!(worker = index, job_id = %job_id, "Skipping cancelled job");
        return;
    }
    send(shared, WorkerReport::Started { job_id }).await;

    let mut attempt = 0;
    loop {
        let registry = shared.registry.clone();
        let record = job.clone();
        let handle = tokio::spawn(async move { run_job(&registry, record).await });
        shared.tracking.lock().start(job_id, handle.abort_handle());
        let joined = handle.await;
        shared.tracking.lock().stop(job_id);

        match joined {
            Ok(outcome) => {
                send(shared, WorkerReport::Finished { job_id, outcome }).await;
                break;
            }
            Err(e) if e.is_cancelled() => {
                debug!(worker = index, job_id = %job_id, "Job aborted");
                send(
                    shared,
                    WorkerReport::Finished {
                        job_id,
                        outcome: Err(ErrorDescriptor::new(ErrorKind::Cancelled, "job aborted")),
                    },
                )
                .await;
                break;
            }
            Err(e) => {
                if attempt < shared.max_redeliveries {
                    attempt += 1;
                    warn!(worker = index, job_id = %job_id, attempt, error = %e, "Worker crashed, redelivering");
                    send(shared, WorkerReport::Redelivered { job_id, attempt }).await;
                    continue;
                }
                error!(worker = index, job_id = %job_id, error = %e, "Redelivery budget spent");
                send(
                    shared,
                    WorkerReport::DeadLettered {
                        job_id,
                        reason: e.to_string(),
                    },
                )
                .await;
                break;
            }
        }
    }
    shared.tracking.lock().release(job_id);
}

async fn run_job(registry: &AgentRegistry, job: JobRecord) -> Result<Payload, ErrorDescriptor> {
    let instance = registry
        .construct(&job.agent, AgentOverrides::default())
        .map_err(|e| e.to_descriptor())?;
    instance
        .execute(AgentContext::new(job.job_id), job.input)
        .await
        .map_err(|e| e.to_descriptor())
}

async fn send(shared: &WorkerShared, report: WorkerReport) {
    let job_id = report.job_id();
    if shared.reports.send(report).await.is_err() {
        warn!(job_id = %job_id, "Report channel closed, dropping worker report");
    }
}
