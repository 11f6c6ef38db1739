//! Task queue adapter for long-running agent invocations.
//!
//! [`TaskQueueAdapter`] submits invocations as [`JobRecord`]s to a
//! [`QueueBackend`], owns their records until they finish, and lets callers
//! poll or subscribe. [`InProcessQueue`] is the bundled backend: a bounded
//! channel drained by worker tasks with at-least-once redelivery of crashed
//! jobs. [`LazyBackend`] defers starting any backend until first use.

/// The adapter and its job table.
pub mod adapter;
/// Backend seam and worker reports.
pub mod backend;
/// In-process worker pool backend.
pub mod inprocess;
/// Serialized job records.
pub mod job;
/// Lazily started backend wrapper.
pub mod lazy;
/// Enqueue retry policy.
pub mod retry;

pub use adapter::{AdapterConfig, JobCallback, QueueStats, TaskQueueAdapter};
pub use backend::{QueueBackend, QueueError, ReportSender, WorkerReport};
pub use inprocess::{InProcessConfig, InProcessQueue};
pub use job::JobRecord;
pub use lazy::LazyBackend;
pub use retry::{compute_backoff, RetryPolicy};
