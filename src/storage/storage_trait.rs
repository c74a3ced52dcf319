//! Repository traits
//!
//! This module defines the persistence interfaces used by the transfer manager, the cleanup
//! sweeps and the activity log batcher.
//!
//! Implementors are responsible for:
//! - Persisting transfer records and their per-chunk metadata
//! - Answering the two sweep queries (stale and stalled transfers)
//! - Bulk-writing activity log events
//!
//! All methods return a `Result` to handle potential storage errors.

use crate::activity_log::types::LogEvent;
use crate::error_handling::types::StorageError;
use crate::transfer::types::{ChunkMetadata, FileTransferRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait TransferRepository: Send + Sync {
    /// Inserts or replaces the record with the same `transfer_id`.
    async fn save_transfer(&self, record: &FileTransferRecord) -> Result<(), StorageError>;

    async fn find_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<FileTransferRecord>, StorageError>;

    /// Deletes the record and its chunk metadata. Deleting an unknown id is not an error.
    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), StorageError>;

    /// Inserts or replaces the metadata of one chunk.
    async fn save_chunk(&self, transfer_id: &str, chunk: &ChunkMetadata)
        -> Result<(), StorageError>;

    /// Chunk metadata ordered by chunk number.
    async fn list_chunks(&self, transfer_id: &str) -> Result<Vec<ChunkMetadata>, StorageError>;

    /// Transfers not IN_PROGRESS whose last update is older than `cutoff`.
    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError>;

    /// IN_PROGRESS transfers whose last update is older than `cutoff`.
    async fn find_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError>;
}

#[async_trait]
pub trait ActivityLogRepository: Send + Sync {
    /// Persists the whole batch in one write.
    async fn save_all(&self, events: &[LogEvent]) -> Result<(), StorageError>;
}
