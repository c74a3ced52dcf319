use crate::activity_log::types::LogEvent;
use crate::error_handling::types::StorageError;
use crate::storage::db_entities::{activity_log, file_transfer, transfer_chunk};
use crate::storage::storage_trait::{ActivityLogRepository, TransferRepository};
use crate::transfer::types::{ChunkMetadata, FileTransferRecord, TransferStatus};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Schema,
};
use uuid::Uuid;

/// SeaORM-backed storage. Tables are created on connect when missing.
pub struct DatabaseStorage {
    db: DatabaseConnection,
}

impl DatabaseStorage {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let db = Database::connect(url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let storage = Self { db };
        storage.create_schema().await?;
        info!("Connected to database storage");
        Ok(storage)
    }

    async fn create_schema(&self) -> Result<(), StorageError> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        let mut statements = vec![
            schema.create_table_from_entity(file_transfer::Entity),
            schema.create_table_from_entity(transfer_chunk::Entity),
            schema.create_table_from_entity(activity_log::Entity),
        ];
        for statement in statements.iter_mut() {
            statement.if_not_exists();
            self.db
                .execute(backend.build(&*statement))
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        }
        Ok(())
    }
}

fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::ReadFailed(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(value)
        .map_err(|e| StorageError::ReadFailed(format!("bad uuid '{}': {}", value, e)))
}

fn read_failed(e: sea_orm::DbErr) -> StorageError {
    StorageError::ReadFailed(e.to_string())
}

fn write_failed(e: sea_orm::DbErr) -> StorageError {
    StorageError::WriteFailed(e.to_string())
}

fn record_from_model(model: file_transfer::Model) -> Result<FileTransferRecord, StorageError> {
    Ok(FileTransferRecord {
        owner_user_id: parse_uuid(&model.owner_user_id)?,
        resource_id: parse_uuid(&model.resource_id)?,
        direction: model.direction.parse().map_err(StorageError::ReadFailed)?,
        status: model.status.parse().map_err(StorageError::ReadFailed)?,
        created_at: parse_timestamp(&model.created_at)?,
        updated_at: parse_timestamp(&model.updated_at)?,
        transfer_id: model.transfer_id,
        remote_path: model.remote_path,
        file_name: model.file_name,
        total_size: model.total_size as u64,
        chunk_size: model.chunk_size as u64,
        total_chunks: model.total_chunks as u32,
        error_message: model.error_message,
    })
}

fn records_from_models(
    models: Vec<file_transfer::Model>,
) -> Result<Vec<FileTransferRecord>, StorageError> {
    models.into_iter().map(record_from_model).collect()
}

#[async_trait]
impl TransferRepository for DatabaseStorage {
    async fn save_transfer(&self, record: &FileTransferRecord) -> Result<(), StorageError> {
        let active = file_transfer::ActiveModel {
            transfer_id: Set(record.transfer_id.clone()),
            owner_user_id: Set(record.owner_user_id.to_string()),
            resource_id: Set(record.resource_id.to_string()),
            direction: Set(record.direction.as_str().to_string()),
            remote_path: Set(record.remote_path.clone()),
            file_name: Set(record.file_name.clone()),
            total_size: Set(record.total_size as i64),
            chunk_size: Set(record.chunk_size as i64),
            total_chunks: Set(record.total_chunks as i32),
            status: Set(record.status.as_str().to_string()),
            error_message: Set(record.error_message.clone()),
            created_at: Set(timestamp(record.created_at)),
            updated_at: Set(timestamp(record.updated_at)),
        };
        let exists = file_transfer::Entity::find_by_id(record.transfer_id.clone())
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .is_some();
        if exists {
            active.update(&self.db).await.map_err(write_failed)?;
        } else {
            active.insert(&self.db).await.map_err(write_failed)?;
        }
        Ok(())
    }

    async fn find_transfer(
        &self,
        transfer_id: &str,
    ) -> Result<Option<FileTransferRecord>, StorageError> {
        file_transfer::Entity::find_by_id(transfer_id.to_string())
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .map(record_from_model)
            .transpose()
    }

    async fn delete_transfer(&self, transfer_id: &str) -> Result<(), StorageError> {
        transfer_chunk::Entity::delete_many()
            .filter(transfer_chunk::Column::TransferId.eq(transfer_id))
            .exec(&self.db)
            .await
            .map_err(write_failed)?;
        file_transfer::Entity::delete_by_id(transfer_id.to_string())
            .exec(&self.db)
            .await
            .map_err(write_failed)?;
        Ok(())
    }

    async fn save_chunk(
        &self,
        transfer_id: &str,
        chunk: &ChunkMetadata,
    ) -> Result<(), StorageError> {
        let id = format!("{}:{}", transfer_id, chunk.chunk_number);
        let active = transfer_chunk::ActiveModel {
            id: Set(id.clone()),
            transfer_id: Set(transfer_id.to_string()),
            chunk_number: Set(chunk.chunk_number as i32),
            size: Set(chunk.size as i64),
            byte_offset: Set(chunk.offset as i64),
            uploaded: Set(chunk.uploaded),
            checksum: Set(chunk.checksum.clone()),
        };
        let exists = transfer_chunk::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(read_failed)?
            .is_some();
        if exists {
            active.update(&self.db).await.map_err(write_failed)?;
        } else {
            active.insert(&self.db).await.map_err(write_failed)?;
        }
        Ok(())
    }

    async fn list_chunks(&self, transfer_id: &str) -> Result<Vec<ChunkMetadata>, StorageError> {
        let models = transfer_chunk::Entity::find()
            .filter(transfer_chunk::Column::TransferId.eq(transfer_id))
            .order_by_asc(transfer_chunk::Column::ChunkNumber)
            .all(&self.db)
            .await
            .map_err(read_failed)?;
        Ok(models
            .into_iter()
            .map(|m| ChunkMetadata {
                chunk_number: m.chunk_number as u32,
                size: m.size as u64,
                offset: m.byte_offset as u64,
                uploaded: m.uploaded,
                checksum: m.checksum,
            })
            .collect())
    }

    async fn find_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError> {
        let models = file_transfer::Entity::find()
            .filter(file_transfer::Column::Status.ne(TransferStatus::InProgress.as_str()))
            .filter(file_transfer::Column::UpdatedAt.lt(timestamp(cutoff)))
            .all(&self.db)
            .await
            .map_err(read_failed)?;
        records_from_models(models)
    }

    async fn find_stalled(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<FileTransferRecord>, StorageError> {
        let models = file_transfer::Entity::find()
            .filter(file_transfer::Column::Status.eq(TransferStatus::InProgress.as_str()))
            .filter(file_transfer::Column::UpdatedAt.lt(timestamp(cutoff)))
            .all(&self.db)
            .await
            .map_err(read_failed)?;
        records_from_models(models)
    }
}

#[async_trait]
impl ActivityLogRepository for DatabaseStorage {
    async fn save_all(&self, events: &[LogEvent]) -> Result<(), StorageError> {
        if events.is_empty() {
            return Ok(());
        }
        let models = events.iter().map(|event| activity_log::ActiveModel {
            id: NotSet,
            user_id: Set(event.user_id.to_string()),
            action: Set(event.action.clone()),
            resource_id: Set(event.resource_id.map(|id| id.to_string())),
            details: Set(event.details.clone()),
            status: Set(event.status.as_str().to_string()),
            error_message: Set(event.error_message.clone()),
            timestamp: Set(timestamp(event.timestamp)),
        });
        activity_log::Entity::insert_many(models)
            .exec(&self.db)
            .await
            .map_err(write_failed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity_log::types::LogStatus;
    use crate::transfer::types::TransferDirection;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> DatabaseStorage {
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("shellgate.sqlite3").display()
        );
        DatabaseStorage::connect(&url)
            .await
            .unwrap_or_else(|e| panic!("{}", e))
    }

    fn record(id: &str, status: TransferStatus, updated_at: DateTime<Utc>) -> FileTransferRecord {
        FileTransferRecord {
            transfer_id: id.to_string(),
            owner_user_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            direction: TransferDirection::Upload,
            remote_path: "/srv/app/release.tar.gz".to_string(),
            file_name: "release.tar.gz".to_string(),
            total_size: 250_000,
            chunk_size: 100_000,
            total_chunks: 3,
            status,
            error_message: None,
            created_at: updated_at,
            updated_at,
        }
    }

    #[tokio::test]
    async fn test_transfer_save_find_update() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;
        let now = Utc::now();

        let mut saved = record("t1", TransferStatus::Pending, now);
        storage.save_transfer(&saved).await.unwrap();
        saved.status = TransferStatus::Failed;
        saved.error_message = Some("connection reset".to_string());
        storage.save_transfer(&saved).await.unwrap();

        let found = storage.find_transfer("t1").await.unwrap().unwrap();
        assert_eq!(found.status, TransferStatus::Failed);
        assert_eq!(found.error_message.as_deref(), Some("connection reset"));
        assert_eq!(found.total_chunks, 3);
        assert_eq!(found.owner_user_id, saved.owner_user_id);
        assert!(storage.find_transfer("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_chunks_are_ordered_and_deleted_with_transfer() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;
        storage
            .save_transfer(&record("t1", TransferStatus::InProgress, Utc::now()))
            .await
            .unwrap();
        for index in [2u32, 0, 1, 0] {
            storage
                .save_chunk(
                    "t1",
                    &ChunkMetadata {
                        chunk_number: index,
                        size: 100,
                        offset: index as u64 * 100,
                        uploaded: true,
                        checksum: Some(format!("sum{}", index)),
                    },
                )
                .await
                .unwrap();
        }

        let chunks = storage.list_chunks("t1").await.unwrap();
        let numbers: Vec<u32> = chunks.iter().map(|c| c.chunk_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);

        storage.delete_transfer("t1").await.unwrap();
        assert!(storage.list_chunks("t1").await.unwrap().is_empty());
        assert!(storage.find_transfer("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sweep_queries() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;
        let now = Utc::now();
        let old = now - Duration::days(8);

        storage
            .save_transfer(&record("old-done", TransferStatus::Completed, old))
            .await
            .unwrap();
        storage
            .save_transfer(&record("old-running", TransferStatus::InProgress, old))
            .await
            .unwrap();
        storage
            .save_transfer(&record("new-failed", TransferStatus::Failed, now))
            .await
            .unwrap();

        let cutoff = now - Duration::days(7);
        let stale: Vec<String> = storage
            .find_stale(cutoff)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.transfer_id)
            .collect();
        assert_eq!(stale, vec!["old-done".to_string()]);

        let stalled: Vec<String> = storage
            .find_stalled(cutoff)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.transfer_id)
            .collect();
        assert_eq!(stalled, vec!["old-running".to_string()]);
    }

    #[tokio::test]
    async fn test_activity_batch_is_written() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;
        let user = Uuid::new_v4();
        let events = vec![
            LogEvent::success(user, "SESSION_INIT", Some(Uuid::new_v4()), "db01"),
            LogEvent::failure(user, "COMMAND_EXECUTE", None, "uptime", "timed out"),
        ];
        storage.save_all(&events).await.unwrap();
        storage.save_all(&[]).await.unwrap();

        let rows = activity_log::Entity::find().all(&storage.db).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .any(|r| r.status == LogStatus::Failure.as_str()
                && r.error_message.as_deref() == Some("timed out")));
    }
}
