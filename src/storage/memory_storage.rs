use crate::activity_log::types::LogEvent;
use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::{ActivityLogRepository, TransferRepository};
use crate::transfer::types::{ChunkMetadata, FileTransferRecord, TransferStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Process-local storage backend, the default when no database is configured.
#[derive(Default)]
pub struct MemoryStorage {
    transfers: RwLock<HashMap<String, FileTransferRecord>>,
    chunks: RwLock<HashMap<String, BTreeMap<u32, ChunkMetadata>>>,
    activity: RwLock<Vec<LogEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activity_events(&self) -> Vec<LogEvent> {
        self.activity.read().await.clone()
    }
}

#[async_trait]
impl TransferRepository for MemoryStorage {
    async fn save_transfer(&self, record: &FileTransferRecord) -> Result<(), StorageError> {
        self.transfers
            .write()
            .await
            .insert(record.transfer_id.clone(), record.clone());
        Ok(())
    }

    async fn find_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<FileTransferRecord>, StorageError> {
        Ok(self.transfers.read().await.get(transfer_id).cloned())
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), StorageError> {
        self.transfers.write().await.remove(transfer_id);
        self.chunks.write().await.remove(transfer_id);
        Ok(())
    }

    async fn save_chunk(
        &self,
        transfer_id: &str,
        chunk: &ChunkMetadata,
    ) -> Result<(), StorageError> {
        self.chunks
            .write()
            .await
            .entry(transfer_id.to_string())
            .or_default()
            .insert(chunk.chunk_number, chunk.clone());
        Ok(())
    }

    async fn list_chunks(&self, transfer_id: &str) -> Result<Vec<ChunkMetadata>, StorageError> {
        Ok(self
            .chunks
            .read()
            .await
            .get(transfer_id)
            .map(|chunks| chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|r| r.status != TransferStatus::InProgress && r.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn find_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError> {
        Ok(self
            .transfers
            .read()
            .await
            .values()
            .filter(|r| r.status == TransferStatus::InProgress && r.updated_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ActivityLogRepository for MemoryStorage {
    async fn save_all(&self, events: &[LogEvent]) -> Result<(), StorageError> {
        self.activity.write().await.extend_from_slice(events);
        Ok(())
    }
}
