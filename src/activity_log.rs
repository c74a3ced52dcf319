//! Activity log: events describing finished operations, batched into bulk writes.

pub mod log_batcher;
pub mod types;

pub use log_batcher::ActivityLogBatcher;
pub use types::{actions, LogEvent, LogStatus};
