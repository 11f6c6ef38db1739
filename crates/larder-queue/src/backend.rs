use crate::job::JobRecord;
use async_trait::async_trait;
use larder_core::{ErrorDescriptor, Payload};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a backend refused a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Transient: the backend is full or unreachable. Worth retrying.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    /// Permanent: retrying the same job will not help.
    #[error("job rejected: {0}")]
    Rejected(String),
}

/// Progress reported by workers back to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    /// A worker picked the job up.
    Started {
        /// Job id.
        job_id: Uuid,
    },
    /// The job ran to completion.
    Finished {
        /// Job id.
        job_id: Uuid,
        /// Output or error.
        outcome: Result<Payload, ErrorDescriptor>,
    },
    /// The worker crashed mid-job and the job is being delivered again.
    Redelivered {
        /// Job id.
        job_id: Uuid,
        /// Redelivery count, starting at one.
        attempt: u32,
    },
    /// The redelivery budget is spent; the job is given up on.
    DeadLettered {
        /// Job id.
        job_id: Uuid,
        /// Why it was given up.
        reason: String,
    },
}

impl WorkerReport {
    /// Job the report is about.
    pub fn job_id(&self) -> Uuid {
        match self {
            WorkerReport::Started { job_id }
            | WorkerReport::Finished { job_id, .. }
            | WorkerReport::Redelivered { job_id, .. }
            | WorkerReport::DeadLettered { job_id, .. } => *job_id,
        }
    }
}

/// Channel workers use to report progress.
pub type ReportSender = mpsc::Sender<WorkerReport>;

/// Capacity of the report channel between workers and the adapter.
pub const REPORT_BUFFER: usize = 1024;

/// A place jobs can be handed off to for execution.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Hand `job` to the backend. Must not block on a full queue.
    async fn enqueue(&self, job: JobRecord) -> Result<(), QueueError>;

    /// Best-effort: stop `job_id` if it is queued or running. Returns `true`
    /// if the backend knew about the job.
    async fn cancel(&self, job_id: Uuid) -> bool;

    /// Jobs accepted but not yet picked up by a worker.
    fn depth(&self) -> usize;
}
