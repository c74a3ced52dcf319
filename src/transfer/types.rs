use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "UPLOAD",
            TransferDirection::Download => "DOWNLOAD",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UPLOAD" => Ok(TransferDirection::Upload),
            "DOWNLOAD" => Ok(TransferDirection::Download),
            other => Err(format!("unknown transfer direction '{}'", other)),
        }
    }
}

/// Transfer lifecycle. Only moves forward: PENDING -> IN_PROGRESS -> COMPLETED | FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "PENDING",
            TransferStatus::InProgress => "IN_PROGRESS",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TransferStatus::Pending),
            "IN_PROGRESS" => Ok(TransferStatus::InProgress),
            "COMPLETED" => Ok(TransferStatus::Completed),
            "FAILED" => Ok(TransferStatus::Failed),
            other => Err(format!("unknown transfer status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRecord {
    pub transfer_id: String,
    pub owner_user_id: Uuid,
    pub resource_id: Uuid,
    pub direction: TransferDirection,
    pub remote_path: String,
    pub file_name: String,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub status: TransferStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileTransferRecord {
    pub fn chunk_offset(&self, chunk_index: u32) -> u64 {
        chunk_index as u64 * self.chunk_size
    }

    /// Length of chunk `chunk_index`; every chunk is `chunk_size` long except maybe the last.
    pub fn chunk_len(&self, chunk_index: u32) -> u64 {
        let offset = self.chunk_offset(chunk_index);
        self.chunk_size.min(self.total_size.saturating_sub(offset))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub chunk_number: u32,
    pub size: u64,
    pub offset: u64,
    /// For downloads: the chunk was served at least once.
    pub uploaded: bool,
    /// SHA-256, lowercase hex.
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub direction: TransferDirection,
    pub remote_path: String,
    pub file_name: String,
    #[serde(default)]
    pub total_size: u64,
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub status: TransferStatus,
    pub transferred_chunks: u32,
    pub total_chunks: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(total_size: u64, chunk_size: u64) -> FileTransferRecord {
        let now = Utc::now();
        FileTransferRecord {
            transfer_id: "t".to_string(),
            owner_user_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            direction: TransferDirection::Upload,
            remote_path: "/tmp/x".to_string(),
            file_name: "x".to_string(),
            total_size,
            chunk_size,
            total_chunks: total_size.div_ceil(chunk_size) as u32,
            status: TransferStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_last_chunk_is_the_remainder() {
        let record = record(250_000, 100_000);
        assert_eq!(record.total_chunks, 3);
        assert_eq!(record.chunk_len(0), 100_000);
        assert_eq!(record.chunk_len(2), 50_000);
        assert_eq!(record.chunk_offset(2), 200_000);
    }

    #[test]
    fn test_status_strings() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::InProgress,
            TransferStatus::Completed,
            TransferStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>(), Ok(status));
        }
        assert!(TransferStatus::Failed.is_terminal());
        assert!(!TransferStatus::InProgress.is_terminal());
        assert_eq!("download".parse(), Ok(TransferDirection::Download));
    }
}
