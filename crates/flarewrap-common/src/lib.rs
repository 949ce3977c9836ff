//! # flarewrap-common
//!
//! Shared utilities and types for the Flarewrap rootfs toolkit.
//!
//! This crate provides common functionality used across all Flarewrap crates:
//! - Validated names, run identifiers and snapshot keys
//! - The working directory layout
//! - Mount instructions shared by snapshotters and mounters
//! - Common error types

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod layout;
pub mod mount;

pub use error::{FlarewrapError, FlarewrapResult, SnapshotErrorKind};
pub use id::{Digest, Name, RunId, SnapshotKey, sanitize_component};
pub use layout::StorageLayout;
pub use mount::{MountSpec, OverlayLayers};
