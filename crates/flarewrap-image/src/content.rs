//! Content-store client boundary.
//!
//! The pipeline only talks to these traits. The containerd backend lives
//! behind the `containerd` feature; tests plug in directory-backed fakes.

use std::sync::Arc;

use async_trait::async_trait;
use flarewrap_common::{FlarewrapResult, MountSpec};

use crate::image::PulledImage;
use crate::reference::ImageReference;

/// Opens sessions against a content store.
#[async_trait]
pub trait ContentStoreConnector: Send + Sync {
    /// Connect to the store listening at `address`.
    ///
    /// # Errors
    ///
    /// Returns [`flarewrap_common::FlarewrapError::Connection`] if the
    /// store cannot be reached.
    async fn connect(&self, address: &str) -> FlarewrapResult<Box<dyn ContentSession>>;
}

/// A connected content-store handle.
///
/// Owned by one pipeline run and closed explicitly when the run ends.
#[async_trait]
pub trait ContentSession: Send + Sync {
    /// Pull and unpack an image.
    ///
    /// Pulling content that is already present must be a cheap no-op.
    async fn pull(&self, reference: &ImageReference) -> FlarewrapResult<PulledImage>;

    /// Snapshot service of a named snapshotter.
    fn snapshots(&self, snapshotter: &str) -> Arc<dyn SnapshotService>;

    /// Close the session.
    async fn close(&self) -> FlarewrapResult<()>;
}

/// Snapshotter operations.
///
/// `prepare` and `view` fail with a `KeyInUse` snapshot error when the
/// key already exists.
#[async_trait]
pub trait SnapshotService: Send + Sync {
    /// Create a writable snapshot on top of `parent`.
    async fn prepare(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>>;

    /// Create a read-only view of `parent`.
    async fn view(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>>;

    /// Mount instructions for an existing snapshot.
    async fn mounts(&self, key: &str) -> FlarewrapResult<Vec<MountSpec>>;

    /// Remove a snapshot.
    async fn remove(&self, key: &str) -> FlarewrapResult<()>;
}
