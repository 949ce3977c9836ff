//! Common error types for the Flarewrap toolkit.

use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`FlarewrapError`].
pub type FlarewrapResult<T> = Result<T, FlarewrapError>;

/// Why a snapshot operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotErrorKind {
    /// The key is already taken by another snapshot or an in-flight run.
    KeyInUse,
    /// The key or the parent does not exist.
    NotFound,
    /// Any other snapshotter failure.
    Backend,
}

impl fmt::Display for SnapshotErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyInUse => write!(f, "key in use"),
            Self::NotFound => write!(f, "not found"),
            Self::Backend => write!(f, "backend failure"),
        }
    }
}

/// Common errors across the Flarewrap crates.
#[derive(Error, Diagnostic, Debug)]
pub enum FlarewrapError {
    /// A host precondition (hypervisor, kernel, socket) is not met.
    #[error("Precondition failed: {what}: {message}")]
    #[diagnostic(code(flarewrap::precondition))]
    Precondition {
        /// The missing or broken prerequisite.
        what: String,
        /// Details.
        message: String,
    },

    /// The content store could not be reached.
    #[error("Failed to connect to content store at {address}: {message}")]
    #[diagnostic(
        code(flarewrap::content::connection),
        help("Check that containerd is running and that the socket is readable by this user")
    )]
    Connection {
        /// The socket address that was tried.
        address: String,
        /// Details.
        message: String,
    },

    /// Pulling or unpacking an image failed.
    #[error("Failed to pull {reference}: {message}")]
    #[diagnostic(code(flarewrap::content::pull))]
    Pull {
        /// The image reference.
        reference: String,
        /// Details.
        message: String,
    },

    /// A snapshot operation failed.
    #[error("Snapshot {key}: {kind}: {message}")]
    #[diagnostic(code(flarewrap::snapshot))]
    Snapshot {
        /// The snapshot key.
        key: String,
        /// Failure class.
        kind: SnapshotErrorKind,
        /// Details.
        message: String,
    },

    /// Mounting or unmounting failed.
    #[error("Mount operation on {} failed: {source}", target.display())]
    #[diagnostic(code(flarewrap::mount))]
    Mount {
        /// The mount point.
        target: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The operation needs elevated privileges.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(flarewrap::permission_denied),
        help("Mounting snapshots and loop devices needs root; try running with sudo")
    )]
    Privilege {
        /// The operation that was denied.
        operation: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Creating the backing file of a block image failed.
    #[error("Failed to allocate {}: {source}", path.display())]
    #[diagnostic(code(flarewrap::block::allocate))]
    Allocation {
        /// The image path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing a filesystem into a block image failed.
    #[error("Failed to format {} as {fs_type}: {message}", path.display())]
    #[diagnostic(
        code(flarewrap::block::format),
        help("The formatter is `mkfs.<type>`; install e2fsprogs for ext4")
    )]
    Format {
        /// The image path.
        path: PathBuf,
        /// Target filesystem type.
        fs_type: String,
        /// Details.
        message: String,
    },

    /// Copying a file tree failed.
    #[error("Failed to copy {}: {message}", path.display())]
    #[diagnostic(code(flarewrap::copy))]
    Copy {
        /// The entry that failed.
        path: PathBuf,
        /// Details.
        message: String,
    },

    /// The working directory could not be prepared.
    #[error("Storage error at {}: {source}", path.display())]
    #[diagnostic(code(flarewrap::storage))]
    Storage {
        /// The directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Starting the virtual machine failed.
    #[error("Failed to launch {machine}: {message}")]
    #[diagnostic(code(flarewrap::launch))]
    Launch {
        /// The machine name.
        machine: String,
        /// Details.
        message: String,
    },

    /// The caller cancelled the run or its deadline passed.
    #[error("Cancelled while {stage}")]
    #[diagnostic(code(flarewrap::cancelled))]
    Cancelled {
        /// What was running.
        stage: String,
    },

    /// Invalid image reference.
    #[error("Invalid image reference: {reference}")]
    #[diagnostic(
        code(flarewrap::image::invalid_reference),
        help("Use forms like 'alpine', 'alpine:3.19' or 'ghcr.io/org/app@sha256:...'")
    )]
    InvalidImageReference {
        /// The invalid value.
        reference: String,
    },

    /// Invalid machine or image name.
    #[error("Invalid name: {name}")]
    #[diagnostic(
        code(flarewrap::invalid_name),
        help("Names must be alphanumeric with '.', '-' and '_', 1-64 characters")
    )]
    InvalidName {
        /// The invalid name.
        name: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(flarewrap::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(flarewrap::serialization))]
    Serialization(String),

    /// Feature not supported on this platform or build.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(flarewrap::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(flarewrap::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(flarewrap::internal),
        help("This is a bug, please report it at https://github.com/shadmanZero/flarewrap/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl FlarewrapError {
    /// Build a snapshot error.
    pub fn snapshot(
        key: impl Into<String>,
        kind: SnapshotErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self::Snapshot {
            key: key.into(),
            kind,
            message: message.into(),
        }
    }

    /// Build a copy error.
    pub fn copy(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        Self::Copy {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Classify a failed mount-style syscall.
    ///
    /// `EPERM`/`EACCES` become [`FlarewrapError::Privilege`], everything
    /// else [`FlarewrapError::Mount`].
    pub fn from_mount(operation: impl Into<String>, target: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::Privilege {
                operation: operation.into(),
                source: err,
            }
        } else {
            Self::Mount {
                target: target.into(),
                source: err,
            }
        }
    }

    /// Whether this failure needs elevated privileges to get past.
    #[must_use]
    pub const fn is_privilege(&self) -> bool {
        matches!(self, Self::Privilege { .. })
    }

    /// Whether this is a snapshot key collision.
    #[must_use]
    pub const fn is_key_in_use(&self) -> bool {
        matches!(
            self,
            Self::Snapshot {
                kind: SnapshotErrorKind::KeyInUse,
                ..
            }
        )
    }

    /// Whether the run was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<serde_json::Error> for FlarewrapError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
