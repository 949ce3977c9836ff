//! Filesystem operations for root filesystems.
//!
//! This module handles:
//! - Host capabilities (mount, loop devices, formatting) behind traits
//! - Scoped mounts that always unmount
//! - Block image allocation, formatting and loop mounting
//! - Metadata-preserving tree copies

mod block;
mod copy;
mod format;
mod loopdev;
mod mounts;
mod scope;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use flarewrap_common::{FlarewrapResult, MountSpec};

pub use block::{BlockImage, BlockImageBuilder, LoopMount, BYTES_PER_MB};
pub use copy::{CopyStats, FilesystemCopier};
pub use format::MkfsFormatter;
pub use loopdev::LoopControl;
pub use mounts::SyscallMounter;
pub use scope::MountScope;

/// Mounts and unmounts filesystems.
pub trait Mounter: Send + Sync {
    /// Mount `spec` at `target`.
    ///
    /// # Errors
    ///
    /// Returns [`flarewrap_common::FlarewrapError::Privilege`] when the
    /// kernel refuses for permission reasons, otherwise a mount error.
    fn mount(&self, spec: &MountSpec, target: &Path) -> FlarewrapResult<()>;

    /// Unmount whatever is mounted at `target`.
    ///
    /// # Errors
    ///
    /// Same classification as [`Mounter::mount`].
    fn unmount(&self, target: &Path) -> FlarewrapResult<()>;
}

/// Attaches regular files as block devices.
pub trait LoopAttacher: Send + Sync {
    /// Attach `file` and return the device path.
    ///
    /// The device detaches itself once its last mount goes away.
    ///
    /// # Errors
    ///
    /// Returns a privilege error when loop control is not accessible.
    fn attach(&self, file: &Path) -> FlarewrapResult<PathBuf>;

    /// Detach a device. Detaching a free device is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be released.
    fn detach(&self, device: &Path) -> FlarewrapResult<()>;
}

/// Writes a filesystem into a file.
pub trait Formatter: Send + Sync {
    /// Format `path` as `fs_type`.
    ///
    /// # Errors
    ///
    /// Returns [`flarewrap_common::FlarewrapError::Format`] on failure.
    fn format(&self, path: &Path, fs_type: &str) -> FlarewrapResult<()>;
}

/// The set of host capabilities a pipeline run needs.
#[derive(Clone)]
pub struct HostBackends {
    /// Mount syscalls.
    pub mounter: Arc<dyn Mounter>,
    /// Loop device control.
    pub loops: Arc<dyn LoopAttacher>,
    /// Filesystem formatter.
    pub formatter: Arc<dyn Formatter>,
}

impl HostBackends {
    /// Backends that talk to the running kernel.
    #[must_use]
    pub fn native() -> Self {
        Self {
            mounter: Arc::new(SyscallMounter),
            loops: Arc::new(LoopControl::default()),
            formatter: Arc::new(MkfsFormatter),
        }
    }
}

impl std::fmt::Debug for HostBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBackends").finish_non_exhaustive()
    }
}
