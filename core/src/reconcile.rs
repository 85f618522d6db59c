//! Orphan sweeper: deletes provisional artifacts nobody committed.
//!
//! Submissions normally purge or commit their own artifact, and a dropped
//! submission schedules a purge from its guard. What slips through (process
//! crash, purge failure, no runtime at drop time) stays provisional and is
//! removed here once it is older than the configured TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::storage::ArtifactStorage;

/// Periodic garbage collector for provisional artifacts.
pub struct OrphanSweeper {
    storage: Arc<dyn ArtifactStorage>,
    max_age: Duration,
}

impl std::fmt::Debug for OrphanSweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrphanSweeper")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

impl OrphanSweeper {
    /// Sweeps provisional artifacts at least `max_age` old.
    #[must_use]
    pub fn new(storage: Arc<dyn ArtifactStorage>, max_age: Duration) -> Self {
        Self { storage, max_age }
    }

    /// One pass. Returns how many artifacts were deleted.
    ///
    /// A failed delete is logged and skipped; the next pass retries it.
    ///
    /// # Errors
    ///
    /// Fails only if the provisional listing itself fails.
    pub async fn sweep_once(&self) -> Result<usize, StorageError> {
        let stale = self.storage.provisional(self.max_age).await?;
        let mut purged = 0;

        for handle in stale {
            match self.storage.delete(&handle).await {
                Ok(()) => {
                    debug!(%handle, "swept orphaned artifact");
                    purged += 1;
                }
                Err(err) => warn!(%handle, error = %err, "could not sweep orphaned artifact"),
            }
        }

        if purged > 0 {
            info!(purged, "orphan sweep finished");
        }
        Ok(purged)
    }

    /// Runs [`Self::sweep_once`] every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.sweep_once().await {
                    warn!(error = %err, "orphan sweep failed");
                }
            }
        })
    }
}
