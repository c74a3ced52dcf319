use crate::error_handling::types::RemoteError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded pool for blocking remote calls.
///
/// Jobs run on tokio's blocking threads; the semaphore caps how many of them may talk to remote
/// hosts at once so request dispatch threads never block on SSH I/O.
pub struct RemoteWorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl RemoteWorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a free worker. Callers that guard the job with a breaker or a deadline take
    /// the permit first, so time spent queued for a worker is never charged to the remote host.
    pub async fn reserve(&self) -> Result<WorkerPermit, RemoteError> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map(WorkerPermit)
            .map_err(|_| RemoteError::WorkerUnavailable("worker pool is closed".to_string()))
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
        T: Send + 'static,
    {
        self.reserve().await?.run(job).await
    }
}

/// A reserved worker slot, released when the job it runs finishes.
pub struct WorkerPermit(OwnedSemaphorePermit);

impl WorkerPermit {
    pub async fn run<T, F>(self, job: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Result<T, RemoteError> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.0;
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        });
        handle
            .await
            .map_err(|e| RemoteError::WorkerUnavailable(e.to_string()))?
    }
}
