use crate::activity_log::types::LogEvent;
use crate::storage::storage_trait::ActivityLogRepository;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Collects activity events and writes them in bulk.
///
/// The batch mutex is held for the whole flush, so appends and flushes never interleave. A
/// failed write drops the batch: delivery is at most once.
pub struct ActivityLogBatcher {
    repository: Arc<dyn ActivityLogRepository>,
    batch_size: usize,
    batch: Mutex<Vec<LogEvent>>,
}

impl ActivityLogBatcher {
    pub fn new(repository: Arc<dyn ActivityLogRepository>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            repository,
            batch_size,
            batch: Mutex::new(Vec::with_capacity(batch_size)),
        }
    }

    /// Appends `event`; reaching the batch size flushes before returning.
    pub async fn receive_log_event(&self, event: LogEvent) {
        let mut batch = self.batch.lock().await;
        batch.push(event);
        if batch.len() >= self.batch_size {
            self.flush_locked(&mut batch).await;
        }
    }

    /// Flushes whatever is batched. Returns the number of events handed to storage.
    pub async fn scheduled_flush(&self) -> usize {
        let mut batch = self.batch.lock().await;
        if batch.is_empty() {
            return 0;
        }
        self.flush_locked(&mut batch).await
    }

    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }

    async fn flush_locked(&self, batch: &mut Vec<LogEvent>) -> usize {
        let events = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        match self.repository.save_all(&events).await {
            Ok(()) => {
                if events.len() >= self.batch_size {
                    info!("Flushed {} activity log events", events.len());
                } else {
                    debug!("Flushed {} activity log events", events.len());
                }
            }
            Err(e) => error!("Dropped {} activity log events: {}", events.len(), e),
        }
        events.len()
    }
}
