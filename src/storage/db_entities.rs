//! SeaORM entity models used by the database storage backend.
//!
//! These structs map to the tables created by `database_storage`:
//! - `file_transfers`: one row per chunked transfer
//! - `transfer_chunks`: per-chunk metadata of a transfer
//! - `activity_logs`: flushed activity log batches
//!
//! Timestamps are stored as RFC3339 strings in UTC with millisecond precision, so string
//! comparison orders them chronologically.

/// Transfer records.
pub mod file_transfer {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "file_transfers")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub transfer_id: String,
        pub owner_user_id: String,
        pub resource_id: String,
        /// `UPLOAD` or `DOWNLOAD`
        pub direction: String,
        pub remote_path: String,
        pub file_name: String,
        pub total_size: i64,
        pub chunk_size: i64,
        pub total_chunks: i32,
        /// Status as its upper-case name
        pub status: String,
        pub error_message: Option<String>,
        pub created_at: String,
        pub updated_at: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Chunk metadata, keyed by `<transfer_id>:<chunk_number>`.
pub mod transfer_chunk {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "transfer_chunks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub transfer_id: String,
        pub chunk_number: i32,
        pub size: i64,
        pub byte_offset: i64,
        pub uploaded: bool,
        pub checksum: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// Activity log events.
pub mod activity_log {
    use sea_orm::entity::prelude::*;

    #[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
    #[sea_orm(table_name = "activity_logs")]
    pub struct Model {
        /// Auto-increment row id
        #[sea_orm(primary_key)]
        pub id: i32,
        pub user_id: String,
        pub action: String,
        pub resource_id: Option<String>,
        pub details: String,
        pub status: String,
        pub error_message: Option<String>,
        pub timestamp: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
