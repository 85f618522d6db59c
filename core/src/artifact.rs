//! Provisional artifact guard.
//!
//! ```text
//!   store() ──► Provisional ──commit()──► Committed ──persisted()──► Persisted
//!                   │                         │
//!                   ├──purge()────────────────┴──────────────────► Purged
//!                   └──drop (either state)──► purge spawned on the runtime
//! ```
//!
//! A submission holds one guard per uploaded artifact. Whatever path the
//! submission takes (rejection, error, or its future being dropped), the
//! artifact ends referenced by a persisted record or deleted. A committed
//! artifact is still purged on drop until the record referencing it exists,
//! since the sweeper only looks at provisional ones. A purge that cannot be
//! scheduled is logged and left to [`crate::OrphanSweeper`].

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::storage::{ArtifactHandle, ArtifactStorage};

/// Lifecycle state of a guarded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// Stored, not yet referenced by any post.
    Provisional,
    /// Marked committed in storage, record not yet persisted.
    Committed,
    /// Referenced by a persisted post or clip; the guard lets go.
    Persisted,
    /// Deleted from storage.
    Purged,
}

/// Owns a provisional artifact until it is committed or purged.
pub struct ProvisionalArtifact {
    storage: Arc<dyn ArtifactStorage>,
    handle: ArtifactHandle,
    state: ArtifactState,
}

impl std::fmt::Debug for ProvisionalArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionalArtifact")
            .field("handle", &self.handle)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ProvisionalArtifact {
    /// Writes `bytes` to `storage` and guards the new artifact.
    ///
    /// # Errors
    ///
    /// Propagates the storage error; nothing is left behind in that case.
    pub async fn store(
        storage: Arc<dyn ArtifactStorage>,
        bytes: Bytes,
        extension: Option<&str>,
    ) -> Result<Self, StorageError> {
        let handle = storage.put(bytes, extension).await?;
        Ok(Self {
            storage,
            handle,
            state: ArtifactState::Provisional,
        })
    }

    /// Handle of the guarded artifact.
    #[must_use]
    pub const fn handle(&self) -> &ArtifactHandle {
        &self.handle
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ArtifactState {
        self.state
    }

    /// Marks the artifact committed in storage. The guard still purges it on
    /// drop until [`Self::persisted`] is called.
    ///
    /// # Errors
    ///
    /// Propagates the storage error; the artifact stays provisional and is
    /// purged when the guard drops.
    pub async fn commit(&mut self) -> Result<(), StorageError> {
        if self.state == ArtifactState::Provisional {
            self.storage.commit(&self.handle).await?;
            self.state = ArtifactState::Committed;
        }
        Ok(())
    }

    /// Releases the guard once a persisted record references the artifact.
    pub fn persisted(&mut self) {
        if self.state == ArtifactState::Committed {
            self.state = ArtifactState::Persisted;
        }
    }

    /// Deletes the artifact now, whatever its state.
    ///
    /// Deletion failures are logged; the sweeper retries provisional leftovers.
    pub async fn purge(mut self) {
        if let Err(err) = self.storage.delete(&self.handle).await {
            warn!(handle = %self.handle, error = %err, "failed to purge artifact");
        } else {
            debug!(handle = %self.handle, "purged artifact");
        }
        self.state = ArtifactState::Purged;
    }
}

impl Drop for ProvisionalArtifact {
    fn drop(&mut self) {
        let state = self.state;
        if !matches!(state, ArtifactState::Provisional | ArtifactState::Committed) {
            return;
        }

        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let storage = Arc::clone(&self.storage);
                warn!(%handle, ?state, "artifact abandoned before persistence, scheduling purge");
                runtime.spawn(async move {
                    if let Err(err) = storage.delete(&handle).await {
                        warn!(%handle, error = %err, "deferred purge failed");
                    }
                });
            }
            Err(_) => {
                warn!(%handle, ?state, "artifact abandoned outside a runtime, left for the sweeper");
            }
        }
    }
}
