use crate::backend::{QueueBackend, QueueError};
use crate::job::JobRecord;
use async_trait::async_trait;
use larder_core::LarderResult;
use tokio::sync::OnceCell;
use tracing::info;
use uuid::Uuid;

type Init<B> = Box<dyn Fn() -> LarderResult<B> + Send + Sync>;

/// Defers building the real backend until the first job arrives.
///
/// A failed build surfaces as [`QueueError::Unavailable`] so the adapter's
/// retry policy applies, and the next enqueue tries again.
pub struct LazyBackend<B> {
    cell: OnceCell<B>,
    init: Init<B>,
}

impl<B: QueueBackend> LazyBackend<B> {
    /// Defer `init` until the first enqueue.
    pub fn new<F>(init: F) -> Self
    where
        F: Fn() -> LarderResult<B> + Send + Sync + 'static,
    {
        Self {
            cell: OnceCell::new(),
            init: Box::new(init),
        }
    }

    /// Whether the backend was built.
    pub fn is_started(&self) -> bool {
        self.cell.initialized()
    }

    async fn backend(&self) -> Result<&B, QueueError> {
        self.cell
            .get_or_try_init(|| async {
                let backend = (self.init)()
                    .map_err(|e| QueueError::Unavailable(format!("backend failed to start: {e}")))?;
                info!("Queue backend started on first use");
                Ok(backend)
            })
            .await
    }
}

#[async_trait]
impl<B: QueueBackend> QueueBackend for LazyBackend<B> {
    async fn enqueue(&self, job: JobRecord) -> Result<(), QueueError> {
        self.backend().await?.enqueue(job).await
    }

    async fn cancel(&self, job_id: Uuid) -> bool {
        match self.cell.get() {
            Some(backend) => backend.cancel(job_id).await,
            None => false,
        }
    }

    fn depth(&self) -> usize {
        self.cell.get().map_or(0, B::depth)
    }
}
