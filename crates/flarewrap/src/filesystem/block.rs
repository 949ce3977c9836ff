//! Block images.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec};
use serde::{Deserialize, Serialize};

use super::HostBackends;

/// Bytes per megabyte; sizes are binary megabytes.
pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// A formatted, fixed-size filesystem image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockImage {
    /// Image file.
    pub path: PathBuf,
    /// Size in megabytes.
    pub size_mb: u64,
    /// Filesystem written into the image.
    pub fs_type: String,
}

/// Allocates, formats and loop-mounts block images.
#[derive(Debug, Clone)]
pub struct BlockImageBuilder {
    backends: HostBackends,
}

impl BlockImageBuilder {
    /// Create a builder over host backends.
    #[must_use]
    pub const fn new(backends: HostBackends) -> Self {
        Self { backends }
    }

    /// Create a zero-filled file of exactly `size_mb` megabytes.
    ///
    /// An existing file at `path` is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Allocation`] if the file cannot be
    /// created or sized.
    pub fn allocate(&self, path: &Path, size_mb: u64) -> FlarewrapResult<()> {
        let failed = |source| FlarewrapError::Allocation {
            path: path.to_path_buf(),
            source,
        };

        let bytes = size_mb.checked_mul(BYTES_PER_MB).filter(|b| *b > 0).ok_or_else(|| {
            failed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid size {size_mb} MB"),
            ))
        })?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(failed)?;
        file.set_len(bytes).map_err(failed)?;
        file.sync_all().map_err(failed)?;

        tracing::debug!(path = %path.display(), bytes, "Allocated block image");
        Ok(())
    }

    /// Write a filesystem into an allocated file.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Format`] if the file is missing or empty,
    /// or the formatter fails.
    pub fn format(&self, path: &Path, fs_type: &str) -> FlarewrapResult<()> {
        let allocated = fs::metadata(path).map(|m| m.is_file() && m.len() > 0).unwrap_or(false);
        if !allocated {
            return Err(FlarewrapError::Format {
                path: path.to_path_buf(),
                fs_type: fs_type.to_string(),
                message: "image file has not been allocated".to_string(),
            });
        }

        self.backends.formatter.format(path, fs_type)?;
        tracing::debug!(path = %path.display(), fs_type, "Formatted block image");
        Ok(())
    }

    /// Allocate and format in one go.
    ///
    /// # Errors
    ///
    /// See [`Self::allocate`] and [`Self::format`].
    pub fn build(&self, path: &Path, size_mb: u64, fs_type: &str) -> FlarewrapResult<BlockImage> {
        self.allocate(path, size_mb)?;
        self.format(path, fs_type)?;
        Ok(BlockImage {
            path: path.to_path_buf(),
            size_mb,
            fs_type: fs_type.to_string(),
        })
    }

    /// Attach `image` to a loop device and mount it at `mount_point`.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Privilege`] when loop control or the
    /// mount is denied, otherwise a mount error.
    pub fn mount_loop(&self, image: &BlockImage, mount_point: &Path) -> FlarewrapResult<LoopMount> {
        fs::create_dir_all(mount_point)?;
        let device = self.backends.loops.attach(&image.path)?;

        let spec = MountSpec::new(&image.fs_type, device.display().to_string(), vec![]);
        if let Err(e) = self.backends.mounter.mount(&spec, mount_point) {
            if let Err(detach) = self.backends.loops.detach(&device) {
                tracing::warn!(device = %device.display(), error = %detach, "Failed to detach loop device");
            }
            return Err(e);
        }

        tracing::debug!(
            image = %image.path.display(),
            device = %device.display(),
            mount_point = %mount_point.display(),
            "Block image mounted"
        );
        Ok(LoopMount {
            backends: self.backends.clone(),
            device,
            mount_point: mount_point.to_path_buf(),
            done: false,
        })
    }
}

/// A block image mounted through a loop device.
///
/// Unmounts and detaches on drop if never released.
#[derive(Debug)]
pub struct LoopMount {
    backends: HostBackends,
    device: PathBuf,
    mount_point: PathBuf,
    done: bool,
}

impl LoopMount {
    /// The loop device.
    #[must_use]
    pub fn device(&self) -> &Path {
        &self.device
    }

    /// Where the filesystem is mounted.
    #[must_use]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Unmount and detach.
    ///
    /// # Errors
    ///
    /// Returns the unmount failure; the device is then left attached.
    pub fn release(mut self) -> FlarewrapResult<()> {
        self.teardown()
    }

    fn teardown(&mut self) -> FlarewrapResult<()> {
        self.done = true;
        self.backends.mounter.unmount(&self.mount_point)?;
        self.backends.loops.detach(&self.device)?;
        tracing::debug!(device = %self.device.display(), "Block image unmounted");
        Ok(())
    }
}

impl Drop for LoopMount {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(mount_point = %self.mount_point.display(), "Loop mount dropped without release");
            if let Err(e) = self.teardown() {
                tracing::warn!(error = %e, "Loop mount cleanup failed");
            }
        }
    }
}
