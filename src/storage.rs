//! Storage subsystem
//!
//! This module provides the persistence interfaces and their implementations for transfer
//! bookkeeping and activity logs.
//!
//! Components:
//! - `storage_trait`: the repository traits.
//! - `memory_storage`: process-local implementation, the default backend.
//! - `database_storage`: ORM-based implementation using SeaORM.
//! - `db_entities`: SeaORM entity models for the database backend.

pub mod database_storage;
pub mod db_entities;
pub mod memory_storage;
pub mod storage_trait;

use crate::configuration::types::{StorageBackend, StorageConfig};
use crate::error_handling::types::StorageError;
use std::sync::Arc;
pub use storage_trait::{ActivityLogRepository, TransferRepository};

/// The repositories used by the rest of the process, backed by the same store.
#[derive(Clone)]
pub struct Repositories {
    pub transfers: Arc<dyn TransferRepository>,
    pub activity: Arc<dyn ActivityLogRepository>,
}

pub async fn open_repositories(config: &StorageConfig) -> Result<Repositories, StorageError> {
    match config.backend {
        StorageBackend::Memory => {
            let storage = Arc::new(memory_storage::MemoryStorage::new());
            Ok(Repositories {
                transfers: storage.clone(),
                activity: storage,
            })
        }
        StorageBackend::Database => {
            let storage =
                Arc::new(database_storage::DatabaseStorage::connect(&config.database_url).await?);
            Ok(Repositories {
                transfers: storage.clone(),
                activity: storage,
            })
        }
    }
}
