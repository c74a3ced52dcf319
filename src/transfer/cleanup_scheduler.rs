use crate::error_handling::types::TransferError;
use crate::storage::storage_trait::TransferRepository;
use crate::transfer::transfer_manager::ChunkedTransferManager;
use chrono::{DateTime, Utc};
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Records returned by the selection query.
    pub examined: usize,
    /// Records the sweep acted on.
    pub handled: usize,
    /// Records that failed; the sweep moved on.
    pub failed: usize,
}

/// The two periodic transfer sweeps. Timing lives with the caller; each sweep takes `now`.
pub struct TransferCleanupScheduler {
    repository: Arc<dyn TransferRepository>,
    manager: Arc<ChunkedTransferManager>,
    retention: Duration,
    stalled_threshold: Duration,
}

impl TransferCleanupScheduler {
    pub fn new(
        repository: Arc<dyn TransferRepository>,
        manager: Arc<ChunkedTransferManager>,
        retention: Duration,
        stalled_threshold: Duration,
    ) -> Self {
        Self {
            repository,
            manager,
            retention,
            stalled_threshold,
        }
    }

    /// Deletes transfers that are not IN_PROGRESS and untouched for longer than the retention
    /// window, with their chunk slots and assembled artifacts.
    pub async fn sweep_stale_artifacts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, TransferError> {
        let Some(cutoff) = cutoff(now, self.retention) else {
            return Ok(SweepReport::default());
        };
        info!("Stale transfer sweep started (cutoff {})", cutoff);
        let candidates = self.repository.find_stale(cutoff).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for record in candidates {
            match self.manager.purge_if_stale(&record.transfer_id, cutoff).await {
                Ok(Some(files)) => {
                    info!(
                        "Removed {} transfer {} and {} scratch files",
                        record.status, record.transfer_id, files
                    );
                    report.handled += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to remove transfer {}: {}", record.transfer_id, e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Stale transfer sweep finished: {} removed, {} failed",
            report.handled, report.failed
        );
        Ok(report)
    }

    /// Fails IN_PROGRESS transfers without an update for longer than the stalled threshold.
    /// Their files are left for the stale sweep.
    pub async fn sweep_stalled_transfers(
        &self,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, TransferError> {
        let Some(cutoff) = cutoff(now, self.stalled_threshold) else {
            return Ok(SweepReport::default());
        };
        info!("Stalled transfer sweep started (cutoff {})", cutoff);
        let message = format!(
            "stalled: no progress for more than {} hours",
            self.stalled_threshold.as_secs() / 3600
        );
        let candidates = self.repository.find_stalled(cutoff).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for record in candidates {
            match self
                .manager
                .fail_if_stalled(&record.transfer_id, cutoff, &message)
                .await
            {
                Ok(true) => {
                    info!(
                        "Transfer {} marked FAILED, last update {}",
                        record.transfer_id, record.updated_at
                    );
                    report.handled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!("Failed to mark transfer {} as stalled: {}", record.transfer_id, e);
                    report.failed += 1;
                }
            }
        }
        info!(
            "Stalled transfer sweep finished: {} failed over, {} errors",
            report.handled, report.failed
        );
        Ok(report)
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> Option<DateTime<Utc>> {
    now.checked_sub_signed(chrono::Duration::from_std(window).ok()?)
}
