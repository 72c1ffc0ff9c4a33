use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::engine::{EngineError, EngineFactory, PassSummary};
use super::events::QueuedWork;
use super::queue::WorkExecutor;

#[derive(Clone, Default)]
pub struct SyncLock {
    inner: Arc<Mutex<()>>,
}

impl SyncLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedMutexGuard<()>, EngineError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            guard = Arc::clone(&self.inner).lock_owned() => Ok(guard),
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[derive(Clone)]
pub struct QueueWorker {
    lock: SyncLock,
    factory: EngineFactory,
}

impl QueueWorker {
    pub fn new(lock: SyncLock, factory: EngineFactory) -> Self {
        Self { lock, factory }
    }

    pub async fn run_pass(
        &self,
        work: &QueuedWork,
        cancel: &CancellationToken,
    ) -> Result<PassSummary, EngineError> {
        let _guard = self.lock.acquire(cancel).await?;
        debug!(work_id = %work.id, "sync lock acquired");
        self.factory.create().run(cancel).await
    }
}

impl WorkExecutor for QueueWorker {
    fn execute(
        &self,
        work: QueuedWork,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<PassSummary, EngineError>> {
        let worker = self.clone();
        async move { worker.run_pass(&work, &cancel).await }.boxed()
    }
}
