//! Scoped mounts.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec};

use super::Mounter;

/// A set of mounts stacked on one target directory.
///
/// Mounts happen in the order given and are undone in reverse. If the
/// scope is dropped without [`MountScope::release`] (a panic, a dropped
/// future), the drop guard unmounts best-effort.
pub struct MountScope {
    mounter: Arc<dyn Mounter>,
    target: PathBuf,
    mounted: Vec<PathBuf>,
    created_target: bool,
    done: bool,
}

impl MountScope {
    /// Mount every spec at `target`.
    ///
    /// `target` is created if absent and must be empty otherwise. On a
    /// partial failure the mounts made so far are undone before the error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns the first mount failure, or a mount error if `target` is
    /// not an empty directory.
    pub fn acquire(mounter: Arc<dyn Mounter>, specs: &[MountSpec], target: &Path) -> FlarewrapResult<Self> {
        let mount_err = |kind: std::io::ErrorKind, msg: &str| FlarewrapError::Mount {
            target: target.to_path_buf(),
            source: std::io::Error::new(kind, msg.to_string()),
        };

        if specs.is_empty() {
            return Err(mount_err(std::io::ErrorKind::InvalidInput, "no mounts to apply"));
        }

        let created_target = if target.exists() {
            if fs::read_dir(target)?.next().is_some() {
                return Err(mount_err(
                    std::io::ErrorKind::DirectoryNotEmpty,
                    "mount target is not empty",
                ));
            }
            false
        } else {
            fs::create_dir_all(target)?;
            true
        };

        let mut scope = Self {
            mounter,
            target: target.to_path_buf(),
            mounted: Vec::with_capacity(specs.len()),
            created_target,
            done: false,
        };

        for spec in specs {
            let point = spec.mount_point(target);
            if let Err(e) = scope.mounter.mount(spec, &point) {
                // Original error wins; teardown failures are only logged
                let _ = scope.teardown();
                return Err(e);
            }
            scope.mounted.push(point);
        }

        tracing::debug!(target = %target.display(), mounts = specs.len(), "Mount scope acquired");
        Ok(scope)
    }

    /// The directory everything is mounted on.
    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Unmount in reverse order and remove the target if this scope
    /// created it.
    ///
    /// Every mount is attempted even after a failure.
    ///
    /// # Errors
    ///
    /// Returns the first unmount failure.
    pub fn release(mut self) -> FlarewrapResult<()> {
        self.teardown()
    }

    /// Leave everything mounted and hand back the target.
    ///
    /// Used when the mounted tree is itself the deliverable.
    #[must_use]
    pub fn into_persistent(mut self) -> PathBuf {
        self.done = true;
        std::mem::take(&mut self.target)
    }

    fn teardown(&mut self) -> FlarewrapResult<()> {
        self.done = true;
        let mut first_error = None;

        while let Some(point) = self.mounted.pop() {
            if let Err(e) = self.mounter.unmount(&point) {
                tracing::warn!(target = %point.display(), error = %e, "Unmount failed");
                first_error.get_or_insert(e);
            }
        }

        if self.created_target && first_error.is_none() {
            if let Err(e) = fs::remove_dir(&self.target) {
                tracing::warn!(target = %self.target.display(), error = %e, "Failed to remove mount target");
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for MountScope {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(target = %self.target.display(), "Mount scope dropped without release");
            let _ = self.teardown();
        }
    }
}

impl std::fmt::Debug for MountScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountScope")
            .field("target", &self.target)
            .field("mounted", &self.mounted)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingMounter {
        log: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Mounter for RecordingMounter {
        fn mount(&self, spec: &MountSpec, target: &Path) -> FlarewrapResult<()> {
            if self.fail_on.as_deref() == Some(spec.source.as_str()) {
                return Err(FlarewrapError::from_mount(
                    "mount",
                    target,
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ));
            }
            self.log.lock().push(format!("mount {}", spec.source));
            Ok(())
        }

        fn unmount(&self, target: &Path) -> FlarewrapResult<()> {
            self.log.lock().push(format!("umount {}", target.display()));
            Ok(())
        }
    }

    fn specs() -> Vec<MountSpec> {
        let mut upper = MountSpec::new("tmpfs", "second", vec![]);
        upper.subpath = Some(PathBuf::from("run"));
        vec![MountSpec::new("overlay", "first", vec![]), upper]
    }

    #[test]
    fn release_unmounts_in_reverse_and_removes_created_target() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("mnt");
        let mounter = Arc::new(RecordingMounter::default());

        let scope = MountScope::acquire(mounter.clone(), &specs(), &target).unwrap();
        assert!(target.is_dir());
        scope.release().unwrap();

        let log = mounter.log.lock().clone();
        assert_eq!(
            log,
            vec![
                "mount first".to_string(),
                "mount second".to_string(),
                format!("umount {}", target.join("run").display()),
                format!("umount {}", target.display()),
            ]
        );
        assert!(!target.exists());
    }

    #[test]
    fn partial_failure_is_unwound() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("mnt");
        let mounter = Arc::new(RecordingMounter {
            fail_on: Some("second".to_string()),
            ..Default::default()
        });

        let err = MountScope::acquire(mounter.clone(), &specs(), &target).unwrap_err();
        assert!(err.is_privilege());
        assert_eq!(mounter.log.lock().len(), 2);
        assert!(!target.exists());
    }

    #[test]
    fn drop_guard_unmounts() {
        let temp = tempfile::tempdir().unwrap();
        let mounter = Arc::new(RecordingMounter::default());
        {
            let _scope = MountScope::acquire(mounter.clone(), &specs()[..1], temp.path()).unwrap();
        }
        assert_eq!(mounter.log.lock().len(), 2);
        // Pre-existing target stays
        assert!(temp.path().exists());
    }

    #[test]
    fn persistent_scope_stays_mounted() {
        let temp = tempfile::tempdir().unwrap();
        let target = temp.path().join("live");
        let mounter = Arc::new(RecordingMounter::default());

        let scope = MountScope::acquire(mounter.clone(), &specs()[..1], &target).unwrap();
        assert_eq!(scope.into_persistent(), target);
        assert_eq!(mounter.log.lock().len(), 1);
    }

    #[test]
    fn non_empty_target_is_refused() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("file"), b"x").unwrap();
        let mounter = Arc::new(RecordingMounter::default());

        let err = MountScope::acquire(mounter, &specs(), temp.path()).unwrap_err();
        assert!(matches!(err, FlarewrapError::Mount { .. }));
    }
}
