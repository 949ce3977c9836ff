//! Snapshot management.
//!
//! Turns a pulled image's chain id into a mountable tree and keeps track of
//! every key it hands out, so a key is never used twice while in flight and
//! every created snapshot is removed exactly once.

use std::collections::HashSet;
use std::sync::Arc;

use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec, SnapshotErrorKind, SnapshotKey};
use parking_lot::Mutex;

use crate::content::SnapshotService;

/// Keys currently claimed by runs in this process.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    keys: Arc<Mutex<HashSet<String>>>,
}

impl KeyRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a key. Returns false if it is already taken.
    pub fn claim(&self, key: &SnapshotKey) -> bool {
        self.keys.lock().insert(key.as_str().to_string())
    }

    /// Give a key back.
    pub fn release(&self, key: &SnapshotKey) {
        self.keys.lock().remove(key.as_str());
    }

    /// Whether a key is claimed.
    #[must_use]
    pub fn contains(&self, key: &SnapshotKey) -> bool {
        self.keys.lock().contains(key.as_str())
    }

    /// Number of claimed keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    /// Whether no key is claimed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

/// How a snapshot was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Copy-on-write, writable.
    Writable,
    /// Read-only view.
    View,
}

/// A snapshot created by [`SnapshotManager`].
///
/// Must be passed back to [`SnapshotManager::remove`] or
/// [`SnapshotManager::keep`].
#[derive(Debug)]
#[must_use = "snapshots must be removed or kept explicitly"]
pub struct SnapshotHandle {
    key: SnapshotKey,
    parent: String,
    mounts: Vec<MountSpec>,
    mode: SnapshotMode,
}

impl SnapshotHandle {
    /// The snapshot key.
    pub const fn key(&self) -> &SnapshotKey {
        &self.key
    }

    /// The parent (chain id) the snapshot was created from.
    pub fn parent(&self) -> &str {
        &self.parent
    }

    /// Mounts returned when the snapshot was created.
    pub fn mounts(&self) -> &[MountSpec] {
        &self.mounts
    }

    /// Creation mode.
    pub const fn mode(&self) -> SnapshotMode {
        self.mode
    }
}

/// Snapshot manager over one snapshotter.
#[derive(Clone)]
pub struct SnapshotManager {
    service: Arc<dyn SnapshotService>,
    registry: KeyRegistry,
}

impl SnapshotManager {
    /// Create a manager.
    pub fn new(service: Arc<dyn SnapshotService>, registry: KeyRegistry) -> Self {
        Self { service, registry }
    }

    /// Create a writable snapshot on top of `parent`.
    ///
    /// # Errors
    ///
    /// Fails with a `KeyInUse` snapshot error if the key is claimed by
    /// another run or already exists in the store.
    pub async fn prepare_writable(&self, key: SnapshotKey, parent: &str) -> FlarewrapResult<SnapshotHandle> {
        self.create(key, parent, SnapshotMode::Writable).await
    }

    /// Create a read-only view of `parent`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::prepare_writable`].
    pub async fn prepare_view(&self, key: SnapshotKey, parent: &str) -> FlarewrapResult<SnapshotHandle> {
        self.create(key, parent, SnapshotMode::View).await
    }

    async fn create(
        &self,
        key: SnapshotKey,
        parent: &str,
        mode: SnapshotMode,
    ) -> FlarewrapResult<SnapshotHandle> {
        if !self.registry.claim(&key) {
            return Err(FlarewrapError::snapshot(
                key.as_str(),
                SnapshotErrorKind::KeyInUse,
                "claimed by another run in this process",
            ));
        }

        let created = match mode {
            SnapshotMode::Writable => self.service.prepare(key.as_str(), parent).await,
            SnapshotMode::View => self.service.view(key.as_str(), parent).await,
        };

        match created {
            Ok(mounts) => {
                tracing::info!(key = %key, parent, ?mode, mounts = mounts.len(), "Snapshot created");
                Ok(SnapshotHandle {
                    key,
                    parent: parent.to_string(),
                    mounts,
                    mode,
                })
            }
            Err(e) => {
                self.registry.release(&key);
                Err(e)
            }
        }
    }

    /// Resolve a handle to mount instructions.
    ///
    /// Asks the snapshotter again and falls back to what creation
    /// returned if it reports nothing.
    ///
    /// # Errors
    ///
    /// Returns the snapshotter's error.
    pub async fn mounts_for(&self, handle: &SnapshotHandle) -> FlarewrapResult<Vec<MountSpec>> {
        let mounts = self.service.mounts(handle.key.as_str()).await?;
        if mounts.is_empty() {
            return Ok(handle.mounts.clone());
        }
        Ok(mounts)
    }

    /// Remove a snapshot and give its key back.
    ///
    /// Safe to call for snapshots that were never mounted. The key is
    /// released even when the store refuses the removal.
    ///
    /// # Errors
    ///
    /// Returns the snapshotter's error so callers can report it; the
    /// failure is logged here already.
    pub async fn remove(&self, handle: SnapshotHandle) -> FlarewrapResult<()> {
        let result = self.remove_key(&handle.key).await;
        self.registry.release(&handle.key);
        result
    }

    /// Remove a snapshot by key, e.g. one recorded for a live rootfs.
    ///
    /// A key that no longer exists counts as removed.
    ///
    /// # Errors
    ///
    /// Returns any other snapshotter error.
    pub async fn remove_key(&self, key: &SnapshotKey) -> FlarewrapResult<()> {
        match self.service.remove(key.as_str()).await {
            Ok(()) => {
                tracing::debug!(key = %key, "Snapshot removed");
                Ok(())
            }
            Err(FlarewrapError::Snapshot {
                kind: SnapshotErrorKind::NotFound,
                ..
            }) => {
                tracing::debug!(key = %key, "Snapshot already gone");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to remove snapshot");
                Err(e)
            }
        }
    }

    /// Keep a snapshot alive past the run that created it.
    ///
    /// The key leaves the in-flight registry; removal becomes the job of
    /// whoever holds the returned key.
    pub fn keep(&self, handle: SnapshotHandle) -> SnapshotKey {
        self.registry.release(&handle.key);
        tracing::info!(key = %handle.key, "Snapshot kept");
        handle.key
    }
}
