//! Per-machine materialization lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flarewrap_common::{FlarewrapError, FlarewrapResult, SnapshotErrorKind};

/// How long a lock file may stay without a readable pid before it is
/// considered abandoned.
const WRITE_GRACE: Duration = Duration::from_secs(10);

/// Exclusive claim on a machine name while its rootfs is built.
///
/// The lock file is created atomically and holds the owner's pid. A file
/// whose pid no longer exists is stale and gets reclaimed.
#[derive(Debug)]
pub struct MachineLock {
    path: PathBuf,
    held: bool,
}

impl MachineLock {
    /// Take the lock at `path` for `machine`.
    ///
    /// # Errors
    ///
    /// Returns a `KeyInUse` snapshot error while another live process (or
    /// another run in this one) holds it.
    pub fn acquire(path: &Path, machine: &str) -> FlarewrapResult<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id()).map_err(|source| FlarewrapError::Storage {
                        path: path.to_path_buf(),
                        source,
                    })?;
                    tracing::debug!(machine, lock = %path.display(), "Machine lock taken");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        held: true,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(pid) = Self::live_holder(path) {
                        return Err(FlarewrapError::snapshot(
                            machine,
                            SnapshotErrorKind::KeyInUse,
                            format!("rootfs is being materialized by pid {pid}"),
                        ));
                    }
                    tracing::warn!(machine, lock = %path.display(), "Reclaiming stale machine lock");
                    match fs::remove_file(path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(source) => {
                            return Err(FlarewrapError::Storage {
                                path: path.to_path_buf(),
                                source,
                            });
                        }
                    }
                }
                Err(source) => {
                    return Err(FlarewrapError::Storage {
                        path: path.to_path_buf(),
                        source,
                    });
                }
            }
        }

        Err(FlarewrapError::snapshot(
            machine,
            SnapshotErrorKind::KeyInUse,
            "lost the race for the machine lock",
        ))
    }

    /// Pid of a live holder.
    ///
    /// A file without a readable pid is treated as held while its writer
    /// may still be mid-write, and as stale once it is older than
    /// [`WRITE_GRACE`].
    fn live_holder(path: &Path) -> Option<String> {
        let pid = fs::read_to_string(path)
            .ok()
            .and_then(|contents| contents.trim().parse::<u32>().ok());
        match pid {
            Some(pid) if Path::new("/proc").join(pid.to_string()).exists() => Some(pid.to_string()),
            Some(_) => None,
            None => {
                let age = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok());
                match age {
                    Some(age) if age > WRITE_GRACE => None,
                    _ => Some("unknown".to_string()),
                }
            }
        }
    }

    /// Give the lock back.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn release(mut self) -> FlarewrapResult<()> {
        self.held = false;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FlarewrapError::Storage {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for MachineLock {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}
