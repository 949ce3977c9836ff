//! Toolkit configuration.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use flarewrap_common::{FlarewrapError, FlarewrapResult};
use serde::{Deserialize, Serialize};

/// How a machine's rootfs is delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Copy the snapshot into a standalone formatted image file.
    #[default]
    BlockImage,
    /// Keep the snapshot mounted and hand out the directory.
    DirectMount,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockImage => write!(f, "block-image"),
            Self::DirectMount => write!(f, "direct-mount"),
        }
    }
}

impl FromStr for Strategy {
    type Err = FlarewrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block-image" => Ok(Self::BlockImage),
            "direct-mount" => Ok(Self::DirectMount),
            other => Err(FlarewrapError::Config {
                message: format!("unknown strategy '{other}' (expected block-image or direct-mount)"),
            }),
        }
    }
}

/// Configuration, built once at startup and passed to every component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlarewrapConfig {
    /// Root of every derived artifact.
    pub working_dir: PathBuf,
    /// Hypervisor binary name or path.
    pub hypervisor: String,
    /// Guest kernel; `<working_dir>/vmlinux` when unset.
    pub kernel_path: Option<PathBuf>,
    /// Content-store socket, tried before any discovery.
    pub containerd_address: Option<PathBuf>,
    /// Content-store namespace.
    pub namespace: String,
    /// Snapshotter name.
    pub snapshotter: String,
    /// Rootfs delivery strategy.
    pub strategy: Strategy,
    /// Filesystem written into block images.
    pub filesystem_type: String,
    /// Timeout for socket and hypervisor probes (seconds).
    pub probe_timeout_secs: u64,
    /// Deadline for one start (seconds); none by default.
    pub pull_timeout_secs: Option<u64>,
}

impl Default for FlarewrapConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("./working"),
            hypervisor: "firecracker".to_string(),
            kernel_path: None,
            containerd_address: None,
            namespace: "flarewrap".to_string(),
            snapshotter: "overlayfs".to_string(),
            strategy: Strategy::BlockImage,
            filesystem_type: "ext4".to_string(),
            probe_timeout_secs: 3,
            pull_timeout_secs: None,
        }
    }
}

impl FlarewrapConfig {
    /// Load a TOML file; missing keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Config`] if the file cannot be read or
    /// parsed.
    pub fn load(path: &Path) -> FlarewrapResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| FlarewrapError::Config {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        toml::from_str(&raw).map_err(|e| FlarewrapError::Config {
            message: format!("invalid {}: {e}", path.display()),
        })
    }

    /// Check values that serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Config`] naming the first bad value.
    pub fn validate(&self) -> FlarewrapResult<()> {
        let bad = |message: &str| {
            Err(FlarewrapError::Config {
                message: message.to_string(),
            })
        };

        if self.working_dir.as_os_str().is_empty() {
            return bad("working_dir must not be empty");
        }
        if self.hypervisor.trim().is_empty() {
            return bad("hypervisor must not be empty");
        }
        if self.namespace.trim().is_empty() || self.snapshotter.trim().is_empty() {
            return bad("namespace and snapshotter must not be empty");
        }
        if self.filesystem_type.is_empty()
            || !self.filesystem_type.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return bad("filesystem_type must be a plain name like ext4");
        }
        if self.probe_timeout_secs == 0 {
            return bad("probe_timeout_secs must be positive");
        }
        if self.pull_timeout_secs == Some(0) {
            return bad("pull_timeout_secs must be positive");
        }
        Ok(())
    }

    /// Guest kernel path, defaulted under the working directory.
    #[must_use]
    pub fn kernel(&self) -> PathBuf {
        self.kernel_path
            .clone()
            .unwrap_or_else(|| self.working_dir.join("vmlinux"))
    }

    /// Probe timeout as a duration.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Start deadline as a duration.
    #[must_use]
    pub fn pull_timeout(&self) -> Option<Duration> {
        self.pull_timeout_secs.map(Duration::from_secs)
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Set the hypervisor binary.
    #[must_use]
    pub fn with_hypervisor(mut self, hypervisor: impl Into<String>) -> Self {
        self.hypervisor = hypervisor.into();
        self
    }

    /// Set the guest kernel.
    #[must_use]
    pub fn with_kernel(mut self, kernel: impl Into<PathBuf>) -> Self {
        self.kernel_path = Some(kernel.into());
        self
    }

    /// Set the content-store socket.
    #[must_use]
    pub fn with_containerd_address(mut self, address: impl Into<PathBuf>) -> Self {
        self.containerd_address = Some(address.into());
        self
    }

    /// Set the rootfs strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the block image filesystem.
    #[must_use]
    pub fn with_filesystem_type(mut self, fs_type: impl Into<String>) -> Self {
        self.filesystem_type = fs_type.into();
        self
    }

    /// Set the deadline for one start.
    #[must_use]
    pub const fn with_pull_timeout(mut self, secs: u64) -> Self {
        self.pull_timeout_secs = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = FlarewrapConfig::default();
        assert_eq!(config.strategy, Strategy::BlockImage);
        assert_eq!(config.filesystem_type, "ext4");
        assert_eq!(config.probe_timeout(), Duration::from_secs(3));
        assert_eq!(config.kernel(), PathBuf::from("./working/vmlinux"));
        config.validate().unwrap();
    }

    #[test]
    fn builder_pattern() {
        let config = FlarewrapConfig::default()
            .with_working_dir("/srv/fw")
            .with_kernel("/boot/vmlinux")
            .with_strategy(Strategy::DirectMount)
            .with_pull_timeout(60);

        assert_eq!(config.kernel(), PathBuf::from("/boot/vmlinux"));
        assert_eq!(config.strategy, Strategy::DirectMount);
        assert_eq!(config.pull_timeout(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("flarewrap.toml");
        std::fs::write(
            &path,
            "working_dir = \"/srv/fw\"\nstrategy = \"direct-mount\"\n",
        )
        .unwrap();

        let config = FlarewrapConfig::load(&path).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/srv/fw"));
        assert_eq!(config.strategy, Strategy::DirectMount);
        assert_eq!(config.snapshotter, "overlayfs");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!("copy".parse::<Strategy>().is_err());
        let config = FlarewrapConfig::default().with_filesystem_type("ext4 -O x");
        assert!(matches!(config.validate(), Err(FlarewrapError::Config { .. })));
    }
}
