//! Artifact storage: "store bytes, get a retrievable handle".
//!
//! Every artifact starts **provisional** and becomes **committed** once a
//! post references it. Provisional state is tracked by the backend so the
//! orphan sweeper can find uploads whose request never finished.
//!
//! Two backends:
//!
//! - [`FsArtifactStorage`] – one file per artifact under a root directory,
//!   plus an empty marker file per provisional artifact under `.provisional/`;
//! - [`MemoryArtifactStorage`] – in-process map that also records every
//!   operation, for tests and the demo.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// Directory (under the storage root) holding provisional markers.
const PROVISIONAL_DIR: &str = ".provisional";

/// Opaque, URL-safe identifier of a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtifactHandle(String);

impl ArtifactHandle {
    /// Validates and wraps `raw`.
    ///
    /// Handles are made of ASCII letters, digits, `_`, `-` and `.`, and may
    /// not start with `.`, so they are safe as file names and URL suffixes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidHandle`] otherwise.
    pub fn parse(raw: &str) -> Result<Self, StorageError> {
        let valid = !raw.is_empty()
            && raw.len() <= 128
            && !raw.starts_with('.')
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
        if valid {
            Ok(Self(raw.to_owned()))
        } else {
            Err(StorageError::InvalidHandle(raw.to_owned()))
        }
    }

    /// Fresh random handle with an optional file extension.
    #[must_use]
    pub fn generate(extension: Option<&str>) -> Self {
        let id = Uuid::new_v4().simple().to_string();
        match extension.map(sanitize_extension) {
            Some(ext) if !ext.is_empty() => Self(format!("{id}.{ext}")),
            _ => Self(id),
        }
    }

    /// The handle as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Public URL path under which the artifact is served.
    #[must_use]
    pub fn url(&self) -> String {
        format!("/uploads/{}", self.0)
    }
}

impl fmt::Display for ArtifactHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize_extension(ext: &str) -> String {
    ext.trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Storage backend for uploaded artifacts.
#[async_trait]
pub trait ArtifactStorage: Send + Sync {
    /// Stores `bytes` as a new provisional artifact.
    async fn put(&self, bytes: Bytes, extension: Option<&str>)
        -> Result<ArtifactHandle, StorageError>;

    /// Reads an artifact back.
    async fn get(&self, handle: &ArtifactHandle) -> Result<Bytes, StorageError>;

    /// Deletes an artifact. Deleting a missing artifact is not an error.
    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError>;

    /// Marks a provisional artifact as committed.
    async fn commit(&self, handle: &ArtifactHandle) -> Result<(), StorageError>;

    /// Provisional artifacts created at least `min_age` ago.
    async fn provisional(&self, min_age: Duration) -> Result<Vec<ArtifactHandle>, StorageError>;
}

/// Filesystem backend rooted at one directory.
#[derive(Debug, Clone)]
pub struct FsArtifactStorage {
    root: PathBuf,
}

impl FsArtifactStorage {
    /// Opens (creating if needed) a storage root.
    ///
    /// # Errors
    ///
    /// Fails if the directories cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(PROVISIONAL_DIR)).await?;
        Ok(Self { root })
    }

    /// Storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn artifact_path(&self, handle: &ArtifactHandle) -> PathBuf {
        self.root.join(handle.as_str())
    }

    fn marker_path(&self, handle: &ArtifactHandle) -> PathBuf {
        self.root.join(PROVISIONAL_DIR).join(handle.as_str())
    }
}

#[async_trait]
impl ArtifactStorage for FsArtifactStorage {
    async fn put(
        &self,
        bytes: Bytes,
        extension: Option<&str>,
    ) -> Result<ArtifactHandle, StorageError> {
        let handle = ArtifactHandle::generate(extension);
        // Marker first: a crash between the two writes leaves a marker the
        // sweeper can clean up, never unmarked bytes.
        tokio::fs::write(self.marker_path(&handle), b"").await?;
        tokio::fs::write(self.artifact_path(&handle), &bytes).await?;
        debug!(%handle, size = bytes.len(), "stored provisional artifact");
        Ok(handle)
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Bytes, StorageError> {
        match tokio::fs::read(self.artifact_path(handle)).await {
            Ok(bytes) => Ok(Bytes::from(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(handle.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        remove_if_present(&self.artifact_path(handle)).await?;
        remove_if_present(&self.marker_path(handle)).await?;
        debug!(%handle, "deleted artifact");
        Ok(())
    }

    async fn commit(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        if !tokio::fs::try_exists(self.artifact_path(handle)).await? {
            return Err(StorageError::NotFound(handle.to_string()));
        }
        remove_if_present(&self.marker_path(handle)).await?;
        debug!(%handle, "committed artifact");
        Ok(())
    }

    async fn provisional(&self, min_age: Duration) -> Result<Vec<ArtifactHandle>, StorageError> {
        let now = SystemTime::now();
        let mut entries = tokio::fs::read_dir(self.root.join(PROVISIONAL_DIR)).await?;
        let mut stale = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(handle) = ArtifactHandle::parse(&name) else {
                continue;
            };
            let modified = entry.metadata().await?.modified()?;
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age >= min_age {
                stale.push(handle);
            }
        }

        stale.sort();
        Ok(stale)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// One call recorded by [`MemoryArtifactStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// `put` returned this handle.
    Put(ArtifactHandle),
    /// `get` was called.
    Get(ArtifactHandle),
    /// `delete` was called.
    Delete(ArtifactHandle),
    /// `commit` was called.
    Commit(ArtifactHandle),
}

#[derive(Debug)]
struct StoredArtifact {
    bytes: Bytes,
    committed: bool,
    created: Instant,
}

#[derive(Debug, Default)]
struct MemoryState {
    artifacts: HashMap<ArtifactHandle, StoredArtifact>,
    ops: Vec<StorageOp>,
}

/// In-memory backend that records every operation.
#[derive(Debug, Default)]
pub struct MemoryArtifactStorage {
    state: Mutex<MemoryState>,
}

impl MemoryArtifactStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations performed so far, in order.
    #[must_use]
    pub fn ops(&self) -> Vec<StorageOp> {
        self.lock().ops.clone()
    }

    /// Number of artifacts currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().artifacts.len()
    }

    /// `true` when nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Some(true)` if committed, `Some(false)` if provisional, `None` if absent.
    #[must_use]
    pub fn is_committed(&self, handle: &ArtifactHandle) -> Option<bool> {
        self.lock().artifacts.get(handle).map(|a| a.committed)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArtifactStorage for MemoryArtifactStorage {
    async fn put(
        &self,
        bytes: Bytes,
        extension: Option<&str>,
    ) -> Result<ArtifactHandle, StorageError> {
        let handle = ArtifactHandle::generate(extension);
        let mut state = self.lock();
        state.artifacts.insert(
            handle.clone(),
            StoredArtifact {
                bytes,
                committed: false,
                created: Instant::now(),
            },
        );
        state.ops.push(StorageOp::Put(handle.clone()));
        Ok(handle)
    }

    async fn get(&self, handle: &ArtifactHandle) -> Result<Bytes, StorageError> {
        let mut state = self.lock();
        state.ops.push(StorageOp::Get(handle.clone()));
        state
            .artifacts
            .get(handle)
            .map(|a| a.bytes.clone())
            .ok_or_else(|| StorageError::NotFound(handle.to_string()))
    }

    async fn delete(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.ops.push(StorageOp::Delete(handle.clone()));
        state.artifacts.remove(handle);
        Ok(())
    }

    async fn commit(&self, handle: &ArtifactHandle) -> Result<(), StorageError> {
        let mut state = self.lock();
        state.ops.push(StorageOp::Commit(handle.clone()));
        match state.artifacts.get_mut(handle) {
            Some(artifact) => {
                artifact.committed = true;
                Ok(())
            }
            None => Err(StorageError::NotFound(handle.to_string())),
        }
    }

    async fn provisional(&self, min_age: Duration) -> Result<Vec<ArtifactHandle>, StorageError> {
        let state = self.lock();
        let mut stale: Vec<ArtifactHandle> = state
            .artifacts
            .iter()
            .filter(|(_, a)| !a.committed && a.created.elapsed() >= min_age)
            .map(|(h, _)| h.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }
}
