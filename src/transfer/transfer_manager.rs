use crate::error_handling::types::{RemoteError, TransferError};
use crate::remote::remote_session::{RemoteEntry, RemoteSession};
use crate::remote::worker_pool::RemoteWorkerPool;
use crate::resilience::breaker_registry::{transfer_breaker_name, CircuitBreakerRegistry};
use crate::resilience::circuit_breaker::CircuitBreakerError;
use crate::session_management::active_session::ActiveSession;
use crate::storage::storage_trait::TransferRepository;
use crate::transfer::chunk_store::{sha256_hex, ChunkStore};
use crate::transfer::types::{
    ChunkAck, ChunkMetadata, FileTransferRecord, TransferDirection, TransferRequest,
    TransferStatus,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Plain file names only: no separators, no leading dot.
const FILE_NAME_PATTERN: &str = r"^[A-Za-z0-9_][A-Za-z0-9._ -]{0,254}$";

pub const CANCELLED_MESSAGE: &str = "cancelled by client";

#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub default_chunk_size: u64,
    pub max_chunk_size: u64,
}

/// Chunked uploads and downloads between clients and remote hosts.
///
/// Chunk bytes are written to (or read from) their destination without holding any lock, so
/// distinct chunks of one transfer move in parallel. Everything that touches the transfer
/// record afterwards runs under a per-transfer mutex and re-reads the record first.
pub struct ChunkedTransferManager {
    repository: Arc<dyn TransferRepository>,
    store: Arc<ChunkStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    pool: Arc<RemoteWorkerPool>,
    limits: TransferLimits,
    file_name_pattern: Regex,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChunkedTransferManager {
    pub fn new(
        repository: Arc<dyn TransferRepository>,
        store: Arc<ChunkStore>,
        breakers: Arc<CircuitBreakerRegistry>,
        pool: Arc<RemoteWorkerPool>,
        limits: TransferLimits,
    ) -> Result<Self, TransferError> {
        let file_name_pattern = Regex::new(FILE_NAME_PATTERN)
            .map_err(|e| TransferError::InvalidRequest(e.to_string()))?;
        Ok(Self {
            repository,
            store,
            breakers,
            pool,
            limits,
            file_name_pattern,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a PENDING transfer owned by the session's key. Downloads take their size from
    /// the remote file; uploads trust the announced size.
    pub async fn init_transfer(
        &self,
        session: &ActiveSession,
        request: TransferRequest,
    ) -> Result<FileTransferRecord, TransferError> {
        if !self.file_name_pattern.is_match(&request.file_name) {
            return Err(TransferError::InvalidRequest(format!(
                "file name '{}' is not allowed",
                request.file_name
            )));
        }
        if request.remote_path.trim().is_empty() {
            return Err(TransferError::InvalidRequest(
                "remote path is empty".to_string(),
            ));
        }
        let chunk_size = request.chunk_size.unwrap_or(self.limits.default_chunk_size);
        if chunk_size == 0 || chunk_size > self.limits.max_chunk_size {
            return Err(TransferError::InvalidRequest(format!(
                "chunk size must be between 1 and {} bytes",
                self.limits.max_chunk_size
            )));
        }

        let total_size = match request.direction {
            TransferDirection::Upload => request.total_size,
            TransferDirection::Download => {
                let path = request.remote_path.clone();
                self.remote_io(session, move |remote| remote.file_size(&path))
                    .await?
            }
        };
        if total_size == 0 {
            return Err(TransferError::InvalidRequest(
                "nothing to transfer: total size is 0".to_string(),
            ));
        }
        let total_chunks = u32::try_from(total_size.div_ceil(chunk_size)).map_err(|_| {
            TransferError::InvalidRequest(format!(
                "{} bytes in chunks of {} is too many chunks",
                total_size, chunk_size
            ))
        })?;

        let now = Utc::now();
        let record = FileTransferRecord {
            transfer_id: Uuid::new_v4().to_string(),
            owner_user_id: session.key.user_id,
            resource_id: session.key.resource_id,
            direction: request.direction,
            remote_path: request.remote_path,
            file_name: request.file_name,
            total_size,
            chunk_size,
            total_chunks,
            status: TransferStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        self.repository.save_transfer(&record).await?;
        info!(
            "Created {} transfer {} for {} on {} ({} bytes, {} chunks)",
            record.direction.as_str(),
            record.transfer_id,
            record.remote_path,
            session.host(),
            record.total_size,
            record.total_chunks
        );
        Ok(record)
    }

    /// Stores one chunk of an upload. The last missing chunk triggers assembly and the copy to
    /// the remote path.
    pub async fn upload_chunk(
        &self,
        session: &ActiveSession,
        transfer_id: &str,
        chunk_index: u32,
        offset: u64,
        bytes: &[u8],
        expected_checksum: Option<&str>,
    ) -> Result<ChunkAck, TransferError> {
        let record = self.load(transfer_id).await?;
        require_direction(&record, TransferDirection::Upload)?;
        require_open(&record)?;
        validate_chunk(&record, chunk_index)?;
        let expected_offset = record.chunk_offset(chunk_index);
        if offset != expected_offset {
            return Err(TransferError::InvalidChunk(format!(
                "chunk {} starts at offset {}, got {}",
                chunk_index, expected_offset, offset
            )));
        }
        let expected_len = record.chunk_len(chunk_index);
        if bytes.len() as u64 != expected_len {
            return Err(TransferError::InvalidChunk(format!(
                "chunk {} must be {} bytes, got {}",
                chunk_index,
                expected_len,
                bytes.len()
            )));
        }
        let checksum = sha256_hex(bytes);
        if let Some(expected) = expected_checksum {
            if !expected.trim().eq_ignore_ascii_case(&checksum) {
                return Err(TransferError::InvalidChunk(format!(
                    "checksum mismatch for chunk {}",
                    chunk_index
                )));
            }
        }

        if let Err(e) = self.store.write_slot(transfer_id, chunk_index, bytes).await {
            let message = format!("failed to store chunk {}: {}", chunk_index, e);
            self.fail(transfer_id, &message).await;
            return Err(TransferError::ChunkIo(message));
        }

        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let mut record = self.load(transfer_id).await?;
        require_open(&record)?;

        self.repository
            .save_chunk(
                transfer_id,
                &ChunkMetadata {
                    chunk_number: chunk_index,
                    size: expected_len,
                    offset,
                    uploaded: true,
                    checksum: Some(checksum),
                },
            )
            .await?;
        if record.status == TransferStatus::Pending {
            record.status = TransferStatus::InProgress;
        }
        record.updated_at = Utc::now();

        let transferred = self.transferred_chunks(&record).await?;
        if transferred == record.total_chunks {
            self.complete_upload(session, &mut record).await?;
        } else {
            self.repository.save_transfer(&record).await?;
        }
        debug!(
            "Transfer {}: chunk {} stored ({}/{})",
            transfer_id, chunk_index, transferred, record.total_chunks
        );

        Ok(ChunkAck {
            transfer_id: record.transfer_id,
            chunk_index,
            status: record.status,
            transferred_chunks: transferred,
            total_chunks: record.total_chunks,
        })
    }

    /// Reads one chunk of a download from the remote file. Serving the last unserved chunk
    /// completes the transfer; completed downloads can still be re-read.
    pub async fn download_chunk(
        &self,
        session: &ActiveSession,
        transfer_id: &str,
        chunk_index: u32,
    ) -> Result<Vec<u8>, TransferError> {
        let record = self.load(transfer_id).await?;
        require_direction(&record, TransferDirection::Download)?;
        if record.status == TransferStatus::Failed {
            return Err(invalid_state(&record));
        }
        validate_chunk(&record, chunk_index)?;

        let offset = record.chunk_offset(chunk_index);
        let len = record.chunk_len(chunk_index);
        let path = record.remote_path.clone();
        let bytes = match self
            .remote_io(session, move |remote| remote.get_file(&path, offset, len))
            .await
        {
            Ok(bytes) => bytes,
            Err(e @ RemoteError::CircuitOpen(_)) => return Err(e.into()),
            Err(e) => {
                self.fail(
                    transfer_id,
                    &format!("failed to read chunk {}: {}", chunk_index, e),
                )
                .await;
                return Err(TransferError::Remote(e));
            }
        };
        if bytes.len() as u64 != len {
            let message = format!(
                "chunk {} returned {} bytes, expected {}; remote file changed",
                chunk_index,
                bytes.len(),
                len
            );
            self.fail(transfer_id, &message).await;
            return Err(TransferError::ChunkIo(message));
        }

        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let mut record = self.load(transfer_id).await?;
        match record.status {
            TransferStatus::Failed => return Err(invalid_state(&record)),
            TransferStatus::Completed => return Ok(bytes),
            _ => {}
        }

        self.repository
            .save_chunk(
                transfer_id,
                &ChunkMetadata {
                    chunk_number: chunk_index,
                    size: len,
                    offset,
                    uploaded: true,
                    checksum: Some(sha256_hex(&bytes)),
                },
            )
            .await?;
        record.status = TransferStatus::InProgress;
        record.updated_at = Utc::now();
        if self.transferred_chunks(&record).await? == record.total_chunks {
            record.status = TransferStatus::Completed;
            info!(
                "Download {} of {} completed ({} bytes)",
                transfer_id, record.remote_path, record.total_size
            );
            self.forget(transfer_id);
        }
        self.repository.save_transfer(&record).await?;
        Ok(bytes)
    }

    pub async fn transfer_status(
        &self,
        transfer_id: &str,
    ) -> Result<FileTransferRecord, TransferError> {
        self.load(transfer_id).await
    }

    /// Chunk metadata of the transfer, for clients resuming an interrupted transfer.
    pub async fn list_chunks(
        &self,
        transfer_id: &str,
    ) -> Result<Vec<ChunkMetadata>, TransferError> {
        self.load(transfer_id).await?;
        Ok(self.repository.list_chunks(transfer_id).await?)
    }

    /// Fails a transfer that is not finished yet and drops its scratch files.
    pub async fn cancel_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<FileTransferRecord, TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let mut record = self.load(transfer_id).await?;
        require_open(&record)?;
        record.status = TransferStatus::Failed;
        record.error_message = Some(CANCELLED_MESSAGE.to_string());
        record.updated_at = Utc::now();
        self.repository.save_transfer(&record).await?;
        self.forget(transfer_id);
        if let Err(e) = self.store.remove_all(transfer_id).await {
            warn!("Failed to remove scratch files of {}: {}", transfer_id, e);
        }
        info!("Transfer {} cancelled", transfer_id);
        Ok(record)
    }

    /// Lists a remote directory over the session's file channel.
    pub async fn list_directory(
        &self,
        session: &ActiveSession,
        path: &str,
    ) -> Result<Vec<RemoteEntry>, RemoteError> {
        let path = path.to_string();
        self.remote_io(session, move |remote| remote.list_dir(&path))
            .await
    }

    /// Fails the transfer with `message` if it is still IN_PROGRESS and was last touched before
    /// `cutoff`. Returns whether it was failed.
    pub async fn fail_if_stalled(
        &self,
        transfer_id: &str,
        cutoff: DateTime<Utc>,
        message: &str,
    ) -> Result<bool, TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let mut record = self.load(transfer_id).await?;
        if record.status != TransferStatus::InProgress || record.updated_at >= cutoff {
            return Ok(false);
        }
        record.status = TransferStatus::Failed;
        record.error_message = Some(message.to_string());
        record.updated_at = Utc::now();
        self.repository.save_transfer(&record).await?;
        self.forget(transfer_id);
        Ok(true)
    }

    /// Deletes a finished or abandoned transfer last touched before `cutoff`, together with its
    /// scratch files. Returns the number of files removed, or `None` when the transfer no
    /// longer qualifies.
    pub async fn purge_if_stale(
        &self,
        transfer_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<usize>, TransferError> {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        let record = match self.repository.find_transfer(transfer_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        if record.status == TransferStatus::InProgress || record.updated_at >= cutoff {
            return Ok(None);
        }
        let removed = self
            .store
            .remove_all(transfer_id)
            .await
            .map_err(|e| TransferError::ChunkIo(e.to_string()))?;
        self.repository.delete_transfer(transfer_id).await?;
        self.forget(transfer_id);
        Ok(Some(removed))
    }

    async fn complete_upload(
        &self,
        session: &ActiveSession,
        record: &mut FileTransferRecord,
    ) -> Result<(), TransferError> {
        let transfer_id = record.transfer_id.clone();
        let (artifact, len) = match self
            .store
            .assemble(&transfer_id, record.total_chunks, &record.file_name)
            .await
        {
            Ok(assembled) => assembled,
            Err(e) => {
                let message = format!("failed to assemble upload: {}", e);
                self.record_failure(record, &message).await;
                return Err(TransferError::ChunkIo(message));
            }
        };
        if len != record.total_size {
            let message = format!(
                "assembled {} bytes, expected {}",
                len, record.total_size
            );
            self.record_failure(record, &message).await;
            return Err(TransferError::ChunkIo(message));
        }

        let remote_path = record.remote_path.clone();
        let local = artifact.clone();
        match self
            .remote_io(session, move |remote| remote.put_file(&local, &remote_path))
            .await
        {
            Ok(_) => {}
            Err(e @ RemoteError::CircuitOpen(_)) => {
                // All chunks stay in place; re-sending any chunk retries the copy.
                self.repository.save_transfer(record).await?;
                return Err(e.into());
            }
            Err(e) => {
                let message = format!("failed to write {}: {}", record.remote_path, e);
                self.record_failure(record, &message).await;
                return Err(TransferError::Remote(e));
            }
        }

        if let Err(e) = self.store.remove_slots(&transfer_id, record.total_chunks).await {
            warn!("Failed to remove chunk slots of {}: {}", transfer_id, e);
        }
        record.status = TransferStatus::Completed;
        record.updated_at = Utc::now();
        self.repository.save_transfer(record).await?;
        self.forget(&transfer_id);
        info!(
            "Upload {} completed: {} bytes written to {} on {} (artifact {})",
            transfer_id,
            len,
            record.remote_path,
            session.host(),
            artifact.display()
        );
        Ok(())
    }

    /// Moves a transfer to FAILED. Used when the caller does not hold the transfer lock.
    async fn fail(&self, transfer_id: &str, message: &str) {
        let lock = self.lock_for(transfer_id);
        let _guard = lock.lock().await;
        match self.repository.find_transfer(transfer_id).await {
            Ok(Some(mut record)) if !record.status.is_terminal() => {
                self.record_failure(&mut record, message).await;
            }
            Ok(_) => {}
            Err(e) => error!("Failed to load transfer {}: {}", transfer_id, e),
        }
    }

    /// Moves a record the caller holds the lock for to FAILED.
    async fn record_failure(&self, record: &mut FileTransferRecord, message: &str) {
        error!("Transfer {} failed: {}", record.transfer_id, message);
        record.status = TransferStatus::Failed;
        record.error_message = Some(message.to_string());
        record.updated_at = Utc::now();
        if let Err(e) = self.repository.save_transfer(record).await {
            error!(
                "Failed to persist failure of transfer {}: {}",
                record.transfer_id, e
            );
        }
        self.forget(&record.transfer_id);
    }

    async fn transferred_chunks(&self, record: &FileTransferRecord) -> Result<u32, TransferError> {
        let chunks = self.repository.list_chunks(&record.transfer_id).await?;
        Ok(chunks
            .iter()
            .filter(|c| c.uploaded && c.chunk_number < record.total_chunks)
            .count() as u32)
    }

    async fn load(&self, transfer_id: &str) -> Result<FileTransferRecord, TransferError> {
        self.repository
            .find_transfer(transfer_id)
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))
    }

    /// Runs a blocking file operation on the worker pool, guarded by the host's file breaker.
    async fn remote_io<T, F>(&self, session: &ActiveSession, job: F) -> Result<T, RemoteError>
    where
        F: FnOnce(&dyn RemoteSession) -> Result<T, RemoteError> + Send + 'static,
        T: Send + 'static,
    {
        let breaker = self.breakers.get(&transfer_breaker_name(session.host()));
        let connection = session.connection.clone();
        let permit = self.pool.reserve().await?;
        let outcome = breaker
            .call_async(|| async move { permit.run(move || job(connection.as_ref())).await })
            .await;
        match outcome {
            Ok(value) => Ok(value),
            Err(CircuitBreakerError::Open(name)) => Err(RemoteError::CircuitOpen(name)),
            Err(CircuitBreakerError::Inner(e)) => Err(e),
        }
    }

    fn lock_for(&self, transfer_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(transfer_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops the lock of a transfer that reached a terminal state or was deleted. Later
    /// operations re-read the record and reject it.
    fn forget(&self, transfer_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(transfer_id);
    }
}

fn invalid_state(record: &FileTransferRecord) -> TransferError {
    TransferError::InvalidState {
        transfer_id: record.transfer_id.clone(),
        status: record.status.to_string(),
    }
}

fn require_open(record: &FileTransferRecord) -> Result<(), TransferError> {
    if record.status.is_terminal() {
        return Err(invalid_state(record));
    }
    Ok(())
}

fn require_direction(
    record: &FileTransferRecord,
    direction: TransferDirection,
) -> Result<(), TransferError> {
    if record.direction != direction {
        return Err(TransferError::InvalidRequest(format!(
            "transfer {} is an {} transfer",
            record.transfer_id,
            record.direction.as_str()
        )));
    }
    Ok(())
}

fn validate_chunk(record: &FileTransferRecord, chunk_index: u32) -> Result<(), TransferError> {
    if chunk_index >= record.total_chunks {
        return Err(TransferError::InvalidChunk(format!(
            "chunk index {} outside 0..{}",
            chunk_index, record.total_chunks
        )));
    }
    Ok(())
}
