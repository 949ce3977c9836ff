//! Metadata-preserving tree copies.
//!
//! Per entry the order is: content, owner, mode, extended attributes,
//! timestamps. Owner goes before mode because `chown` clears set-id bits.
//! Directories get their metadata after their children are written, so
//! read-only directories and directory mtimes come out right.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use flarewrap_common::{FlarewrapError, FlarewrapResult};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// What a copy did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Regular files written.
    pub files: u64,
    /// Directories created.
    pub directories: u64,
    /// Symlinks created.
    pub symlinks: u64,
    /// Hard links recreated.
    pub hardlinks: u64,
    /// Device nodes, FIFOs and sockets.
    pub special: u64,
    /// Bytes of file content.
    pub bytes: u64,
}

/// Recursive copier.
#[derive(Debug, Clone, Default)]
pub struct FilesystemCopier {
    cancel: Option<CancellationToken>,
}

impl FilesystemCopier {
    /// Create a copier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop between entries once `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Copy everything below `source` into `destination`.
    ///
    /// Symlinks are copied as links. `destination` is created if missing
    /// and gets the metadata of `source`.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Copy`] naming the entry that failed, or
    /// [`FlarewrapError::Cancelled`]. Either way `destination` is left
    /// partially written.
    pub fn copy_tree(&self, source: &Path, destination: &Path) -> FlarewrapResult<CopyStats> {
        let privileged = rustix::process::geteuid().is_root();
        let mut stats = CopyStats::default();
        let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();
        let mut directories: Vec<(PathBuf, Metadata)> = Vec::new();

        for entry in WalkDir::new(source).follow_links(false) {
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(FlarewrapError::Cancelled {
                    stage: "copying rootfs".to_string(),
                });
            }

            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| source.to_path_buf(), Path::to_path_buf);
                FlarewrapError::copy(path, e)
            })?;
            let src = entry.path();
            let rel = src
                .strip_prefix(source)
                .map_err(|e| FlarewrapError::copy(src, e))?;
            let dst = destination.join(rel);
            let meta = entry.metadata().map_err(|e| FlarewrapError::copy(src, e))?;
            let file_type = meta.file_type();

            if file_type.is_dir() {
                match fs::create_dir(&dst) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dst.is_dir() => {}
                    Err(e) => return Err(FlarewrapError::copy(&dst, e)),
                }
                // Writable until the children are in
                fs::set_permissions(&dst, fs::Permissions::from_mode(0o700))
                    .map_err(|e| FlarewrapError::copy(&dst, e))?;
                directories.push((src.to_path_buf(), meta));
                stats.directories += 1;
                continue;
            }

            remove_existing(&dst)?;

            if meta.nlink() > 1 {
                if let Some(first) = links.get(&(meta.dev(), meta.ino())) {
                    fs::hard_link(first, &dst).map_err(|e| FlarewrapError::copy(&dst, e))?;
                    stats.hardlinks += 1;
                    continue;
                }
                links.insert((meta.dev(), meta.ino()), dst.clone());
            }

            if file_type.is_symlink() {
                let target = fs::read_link(src).map_err(|e| FlarewrapError::copy(src, e))?;
                std::os::unix::fs::symlink(&target, &dst).map_err(|e| FlarewrapError::copy(&dst, e))?;
                stats.symlinks += 1;
            } else if file_type.is_file() {
                stats.bytes += copy_contents(src, &dst)?;
                stats.files += 1;
            } else {
                make_special(&dst, &meta)?;
                stats.special += 1;
            }

            apply_metadata(src, &dst, &meta, privileged)?;
        }

        // Deepest first
        for (src, meta) in directories.iter().rev() {
            let rel = src.strip_prefix(source).map_err(|e| FlarewrapError::copy(src, e))?;
            apply_metadata(src, &destination.join(rel), meta, privileged)?;
        }

        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            ?stats,
            "Tree copied"
        );
        Ok(stats)
    }
}

fn remove_existing(dst: &Path) -> FlarewrapResult<()> {
    match fs::remove_file(dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(FlarewrapError::copy(dst, e)),
    }
}

fn copy_contents(src: &Path, dst: &Path) -> FlarewrapResult<u64> {
    let mut reader = File::open(src).map_err(|e| FlarewrapError::copy(src, e))?;
    let mut writer = File::create(dst).map_err(|e| FlarewrapError::copy(dst, e))?;
    let bytes = io::copy(&mut reader, &mut writer).map_err(|e| FlarewrapError::copy(dst, e))?;
    writer.sync_data().map_err(|e| FlarewrapError::copy(dst, e))?;
    Ok(bytes)
}

fn make_special(dst: &Path, meta: &Metadata) -> FlarewrapResult<()> {
    use rustix::fs::{CWD, FileType, Mode, mknodat};

    let mode = meta.mode();
    mknodat(
        CWD,
        dst,
        FileType::from_raw_mode(mode),
        Mode::from_raw_mode(mode & 0o7777),
        meta.rdev(),
    )
    .map_err(|e| FlarewrapError::copy(dst, io::Error::from(e)))
}

fn apply_metadata(src: &Path, dst: &Path, meta: &Metadata, privileged: bool) -> FlarewrapResult<()> {
    let is_symlink = meta.file_type().is_symlink();

    if let Err(e) = std::os::unix::fs::lchown(dst, Some(meta.uid()), Some(meta.gid())) {
        // Unprivileged copies keep the caller as owner
        if privileged || e.kind() != io::ErrorKind::PermissionDenied {
            return Err(FlarewrapError::copy(dst, e));
        }
    }

    if !is_symlink {
        fs::set_permissions(dst, fs::Permissions::from_mode(meta.mode() & 0o7777))
            .map_err(|e| FlarewrapError::copy(dst, e))?;
    }

    copy_xattrs(src, dst, privileged);

    let atime = FileTime::from_last_access_time(meta);
    let mtime = FileTime::from_last_modification_time(meta);
    filetime::set_symlink_file_times(dst, atime, mtime).map_err(|e| FlarewrapError::copy(dst, e))?;

    Ok(())
}

/// Best-effort: filesystems without xattr support or attributes the
/// caller may not set are skipped.
fn copy_xattrs(src: &Path, dst: &Path, privileged: bool) {
    let Ok(names) = xattr::list(src) else {
        return;
    };

    for name in names {
        if !privileged && name.to_string_lossy().starts_with("trusted.") {
            continue;
        }
        let Ok(Some(value)) = xattr::get(src, &name) else {
            continue;
        };
        if let Err(e) = xattr::set(dst, &name, &value) {
            tracing::debug!(path = %dst.display(), attr = ?name, error = %e, "Skipped xattr");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    fn sample_tree(root: &Path) {
        fs::create_dir_all(root.join("etc/conf.d")).unwrap();
        fs::write(root.join("etc/hostname"), b"flarewrap\n").unwrap();
        fs::write(root.join("etc/conf.d/net"), b"dhcp\n").unwrap();
        fs::write(root.join("etc/shadow"), b"root:*:\n").unwrap();
        fs::set_permissions(root.join("etc/shadow"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::write(root.join("run.sh"), b"#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("run.sh"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("etc/hostname", root.join("name-link")).unwrap();
        symlink("/does/not/exist", root.join("dangling")).unwrap();
        fs::hard_link(root.join("etc/hostname"), root.join("hostname.hard")).unwrap();
    }

    #[test]
    fn copies_content_links_and_modes() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        sample_tree(&src);

        let stats = FilesystemCopier::new().copy_tree(&src, &dst).unwrap();
        assert_eq!(stats.symlinks, 2);
        assert_eq!(stats.hardlinks, 1);

        assert_eq!(fs::read(dst.join("etc/conf.d/net")).unwrap(), b"dhcp\n");
        assert_eq!(fs::read_link(dst.join("dangling")).unwrap(), PathBuf::from("/does/not/exist"));
        assert_eq!(
            fs::metadata(dst.join("etc/shadow")).unwrap().permissions().mode() & 0o7777,
            0o600
        );
        assert_eq!(
            fs::metadata(dst.join("hostname.hard")).unwrap().ino(),
            fs::metadata(dst.join("etc/hostname")).unwrap().ino()
        );
    }

    #[test]
    fn read_only_directory_is_filled_before_locking() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("ro")).unwrap();
        fs::write(src.join("ro/file"), b"x").unwrap();
        fs::set_permissions(src.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        FilesystemCopier::new().copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("ro/file")).unwrap(), b"x");
        assert_eq!(
            fs::metadata(dst.join("ro")).unwrap().permissions().mode() & 0o7777,
            0o555
        );

        fs::set_permissions(src.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(dst.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn fifo_is_recreated() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir(&src).unwrap();
        mknodat_fifo(&src.join("pipe"));

        let stats = FilesystemCopier::new().copy_tree(&src, &dst).unwrap();
        assert_eq!(stats.special, 1);
        use std::os::unix::fs::FileTypeExt;
        assert!(fs::symlink_metadata(dst.join("pipe")).unwrap().file_type().is_fifo());
    }

    #[test]
    fn mtime_is_preserved() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("old"), b"x").unwrap();
        let past = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_mtime(src.join("old"), past).unwrap();

        FilesystemCopier::new().copy_tree(&src, &dst).unwrap();
        let meta = fs::metadata(dst.join("old")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta), past);
    }

    #[test]
    fn cancelled_copy_stops() {
        let temp = tempfile::tempdir().unwrap();
        let src = temp.path().join("src");
        sample_tree(&src);

        let token = CancellationToken::new();
        token.cancel();
        let err = FilesystemCopier::new()
            .with_cancel(token)
            .copy_tree(&src, &temp.path().join("dst"))
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    fn mknodat_fifo(path: &Path) {
        use rustix::fs::{CWD, FileType, Mode, mknodat};
        mknodat(CWD, path, FileType::Fifo, Mode::from_raw_mode(0o644), 0).unwrap();
    }
}
