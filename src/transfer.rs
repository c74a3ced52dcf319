//! Chunked file transfers.
//!
//! - `types`: transfer records, chunk metadata and request/ack payloads.
//! - `chunk_store`: scratch-directory layout for chunk slots and assembled uploads.
//! - `transfer_manager`: upload/download state machine.
//! - `cleanup_scheduler`: stale-artifact and stalled-transfer sweeps.

pub mod chunk_store;
pub mod cleanup_scheduler;
pub mod transfer_manager;
pub mod types;

pub use chunk_store::ChunkStore;
pub use cleanup_scheduler::{SweepReport, TransferCleanupScheduler};
pub use transfer_manager::{ChunkedTransferManager, TransferLimits};
