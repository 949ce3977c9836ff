//! # flarewrap-image
//!
//! Images, content-store access and snapshots for Flarewrap.
//!
//! This crate provides:
//! - Image reference parsing and the local image metadata store
//! - OCI manifest handling and layer chain ids
//! - The content-store boundary (connector, session, snapshot service)
//! - [`SnapshotManager`], which hands out and reclaims snapshot keys
//! - Content-store socket discovery
//! - A containerd backend (feature `containerd`)

#![warn(missing_docs)]

pub mod content;
pub mod image;
pub mod oci;
pub mod reference;
pub mod snapshot;
pub mod socket;
pub mod store;

#[cfg(feature = "containerd")]
pub mod containerd;

pub use content::{ContentSession, ContentStoreConnector, SnapshotService};
pub use image::{Image, ImageMetadata, PulledImage};
pub use reference::{ImageReference, ImageTag};
pub use snapshot::{KeyRegistry, SnapshotHandle, SnapshotManager, SnapshotMode};
pub use socket::{discover_socket, probe_socket};
pub use store::{ImageStore, ResolvedImage};

#[cfg(feature = "containerd")]
pub use containerd::ContainerdConnector;
