//! OS-level mount instructions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One mount to perform, as reported by a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Filesystem type (`overlay`, `bind`, `ext4`, ...).
    pub fs_type: String,
    /// Mount source (a directory, a block device or a pseudo name).
    pub source: String,
    /// Path below the mount target, empty for the target itself.
    #[serde(default)]
    pub subpath: Option<PathBuf>,
    /// Mount options in `mount(8)` syntax.
    #[serde(default)]
    pub options: Vec<String>,
}

impl MountSpec {
    /// Create a mount spec.
    pub fn new(fs_type: impl Into<String>, source: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            fs_type: fs_type.into(),
            source: source.into(),
            subpath: None,
            options,
        }
    }

    /// A bind mount of `source`.
    #[must_use]
    pub fn bind(source: &Path, readonly: bool) -> Self {
        let mut options = vec!["rbind".to_string()];
        options.push(if readonly { "ro" } else { "rw" }.to_string());
        Self::new("bind", source.display().to_string(), options)
    }

    /// Where this spec lands below `target`.
    #[must_use]
    pub fn mount_point(&self, target: &Path) -> PathBuf {
        match &self.subpath {
            Some(sub) => target.join(sub.strip_prefix("/").unwrap_or(sub)),
            None => target.to_path_buf(),
        }
    }

    /// Whether the options ask for a read-only mount.
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    /// Whether this is a bind mount.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.fs_type == "bind" || self.options.iter().any(|o| o == "bind" || o == "rbind")
    }

    /// The overlay directory set, for overlay mounts.
    #[must_use]
    pub fn overlay_layers(&self) -> Option<OverlayLayers> {
        if self.fs_type != "overlay" {
            return None;
        }
        OverlayLayers::from_options(&self.options)
    }
}

/// Lower, upper and work directories of an overlay mount.
///
/// `lower_dirs` is ordered top-most first, the way the kernel expects it.
/// A view (read-only) snapshot has lower directories only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLayers {
    /// Lower directories (read-only layers).
    pub lower_dirs: Vec<PathBuf>,
    /// Upper directory (writable layer).
    pub upper_dir: Option<PathBuf>,
    /// Work directory (required with an upper directory).
    pub work_dir: Option<PathBuf>,
}

impl OverlayLayers {
    /// Parse `lowerdir=`/`upperdir=`/`workdir=` out of mount options.
    #[must_use]
    pub fn from_options(options: &[String]) -> Option<Self> {
        let mut lower_dirs = Vec::new();
        let mut upper_dir = None;
        let mut work_dir = None;

        for option in options {
            if let Some(lower) = option.strip_prefix("lowerdir=") {
                lower_dirs = lower
                    .split(':')
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from)
                    .collect();
            } else if let Some(upper) = option.strip_prefix("upperdir=") {
                upper_dir = Some(PathBuf::from(upper));
            } else if let Some(work) = option.strip_prefix("workdir=") {
                work_dir = Some(PathBuf::from(work));
            }
        }

        if lower_dirs.is_empty() {
            return None;
        }

        Some(Self {
            lower_dirs,
            upper_dir,
            work_dir,
        })
    }

    /// Whether writes go anywhere.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.upper_dir.is_some() && self.work_dir.is_some()
    }
}
