//! Working directory layout.

use std::path::{Path, PathBuf};

use crate::error::{FlarewrapError, FlarewrapResult};
use crate::id::RunId;

/// Subdirectories every working directory must have.
pub const WORKING_DIRS: &[&str] = &["images", "temp", "machines", "logs", "rootfs"];

/// Paths derived from one working directory.
///
/// Everything Flarewrap writes to disk lives below `root`:
///
/// ```text
/// <root>/
///   images/<logical>.json    image metadata
///   images/<logical>.img     image block file
///   temp/<run-id>/           per-run scratch space
///   machines/<name>.json     machine records
///   machines/<name>.lock     in-flight lock
///   logs/                    flarewrap and VM logs
///   rootfs/                  materialized root filesystems
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// Working directory.
    root: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `root`. Nothing is touched on disk.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The working directory itself.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the fixed subdirectory set if absent.
    ///
    /// Idempotent: existing directories are left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Storage`] if a directory cannot be created.
    pub fn ensure_structure(&self) -> FlarewrapResult<()> {
        for dir in WORKING_DIRS {
            let path = self.root.join(dir);
            if path.is_dir() {
                continue;
            }
            std::fs::create_dir_all(&path).map_err(|source| FlarewrapError::Storage {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(path = %path.display(), "Created working directory");
        }
        Ok(())
    }

    /// Directory for image metadata and files.
    #[must_use]
    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    /// Image block file for a logical name.
    #[must_use]
    pub fn image_file(&self, logical_name: &str) -> PathBuf {
        self.images().join(format!("{logical_name}.img"))
    }

    /// Image metadata file for a logical name.
    #[must_use]
    pub fn image_metadata(&self, logical_name: &str) -> PathBuf {
        self.images().join(format!("{logical_name}.json"))
    }

    /// Scratch root.
    #[must_use]
    pub fn temp(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Scratch directory owned by one run.
    #[must_use]
    pub fn run_scratch(&self, run: &RunId) -> PathBuf {
        self.temp().join(run.as_str())
    }

    /// Directory for machine records.
    #[must_use]
    pub fn machines(&self) -> PathBuf {
        self.root.join("machines")
    }

    /// Machine record file.
    #[must_use]
    pub fn machine_record(&self, name: &str) -> PathBuf {
        self.machines().join(format!("{name}.json"))
    }

    /// Lock file held while a machine's rootfs is being materialized.
    #[must_use]
    pub fn machine_lock(&self, name: &str) -> PathBuf {
        self.machines().join(format!("{name}.lock"))
    }

    /// Per-machine directory (hypervisor config).
    #[must_use]
    pub fn machine_dir(&self, name: &str) -> PathBuf {
        self.machines().join(name)
    }

    /// Log directory.
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    /// Log file of a machine's hypervisor process.
    #[must_use]
    pub fn machine_log(&self, name: &str) -> PathBuf {
        self.logs().join(format!("{name}.log"))
    }

    /// Directory for materialized root filesystems.
    #[must_use]
    pub fn rootfs(&self) -> PathBuf {
        self.root.join("rootfs")
    }

    /// Mounted rootfs directory (direct-mount strategy).
    ///
    /// `image` must already be a safe path component.
    #[must_use]
    pub fn rootfs_dir(&self, machine: &str, image: &str) -> PathBuf {
        self.rootfs().join(format!("{machine}-{image}"))
    }

    /// Block image rootfs (block-image strategy).
    #[must_use]
    pub fn rootfs_image(&self, machine: &str, fs_type: &str) -> PathBuf {
        self.rootfs().join(format!("{machine}-rootfs.{fs_type}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        let layout = StorageLayout::new("/tmp/fw");
        assert_eq!(layout.image_file("alpine"), PathBuf::from("/tmp/fw/images/alpine.img"));
        assert_eq!(
            layout.image_metadata("alpine"),
            PathBuf::from("/tmp/fw/images/alpine.json")
        );
        assert_eq!(
            layout.rootfs_image("default", "ext4"),
            PathBuf::from("/tmp/fw/rootfs/default-rootfs.ext4")
        );
        assert_eq!(
            layout.rootfs_dir("default", "alpine_latest"),
            PathBuf::from("/tmp/fw/rootfs/default-alpine_latest")
        );
    }

    #[test]
    fn ensure_structure_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(temp.path());

        layout.ensure_structure().unwrap();
        for dir in WORKING_DIRS {
            assert!(temp.path().join(dir).is_dir());
        }

        std::fs::write(layout.images().join("marker"), b"x").unwrap();
        layout.ensure_structure().unwrap();
        assert!(layout.images().join("marker").exists());
    }

    #[test]
    fn ensure_structure_reports_storage_error() {
        let temp = tempfile::tempdir().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let err = StorageLayout::new(&blocker).ensure_structure().unwrap_err();
        assert!(matches!(err, FlarewrapError::Storage { .. }));
    }
}
