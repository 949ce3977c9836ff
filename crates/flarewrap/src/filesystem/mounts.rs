//! Mount syscalls.

use std::ffi::CString;
use std::path::Path;

use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec};
use rustix::mount::{MountFlags, mount, mount_bind_recursive, mount_remount};

use super::Mounter;

/// [`Mounter`] backed by `mount(2)` and `umount2(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallMounter;

/// Mount options split into flags and filesystem data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParsedOptions {
    pub flags: MountFlags,
    pub data: String,
}

/// Split `mount(8)` style options into `MS_*` flags and the data string.
pub(crate) fn parse_options(options: &[String]) -> ParsedOptions {
    let mut flags = MountFlags::empty();
    let mut data = Vec::new();

    for option in options {
        match option.as_str() {
            "ro" => flags |= MountFlags::RDONLY,
            "rw" | "defaults" => flags.remove(MountFlags::RDONLY),
            "nosuid" => flags |= MountFlags::NOSUID,
            "nodev" => flags |= MountFlags::NODEV,
            "noexec" => flags |= MountFlags::NOEXEC,
            "sync" => flags |= MountFlags::SYNCHRONOUS,
            "noatime" => flags |= MountFlags::NOATIME,
            "nodiratime" => flags |= MountFlags::NODIRATIME,
            "relatime" => flags |= MountFlags::RELATIME,
            "bind" => flags |= MountFlags::BIND,
            "rbind" => flags |= MountFlags::BIND | MountFlags::REC,
            other => data.push(other),
        }
    }

    ParsedOptions {
        flags,
        data: data.join(","),
    }
}

fn invalid(target: &Path, message: impl Into<String>) -> FlarewrapError {
    FlarewrapError::Mount {
        target: target.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, message.into()),
    }
}

/// Refuse overlay specs the kernel would reject with a bare `EINVAL`.
pub(crate) fn check_overlay(spec: &MountSpec, target: &Path) -> FlarewrapResult<()> {
    let layers = spec
        .overlay_layers()
        .ok_or_else(|| invalid(target, "overlay mount without lowerdir"))?;
    if layers.upper_dir.is_some() != layers.work_dir.is_some() {
        return Err(invalid(target, "overlay upperdir and workdir must come together"));
    }

    tracing::debug!(
        target = %target.display(),
        lower = layers.lower_dirs.len(),
        writable = layers.is_writable(),
        "Overlay layers"
    );
    Ok(())
}

impl Mounter for SyscallMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> FlarewrapResult<()> {
        let parsed = parse_options(&spec.options);
        let failed = |e: rustix::io::Errno| {
            FlarewrapError::from_mount(format!("mount {} {}", spec.fs_type, spec.source), target, e.into())
        };

        tracing::debug!(
            fs_type = %spec.fs_type,
            source = %spec.source,
            target = %target.display(),
            options = ?spec.options,
            "Mounting filesystem"
        );

        if spec.is_bind() {
            mount_bind_recursive(spec.source.as_str(), target).map_err(failed)?;
            // MS_RDONLY is ignored on the initial bind; it takes a remount
            if spec.is_readonly() {
                if let Err(e) = mount_remount(target, MountFlags::BIND | MountFlags::RDONLY, "") {
                    let _ = self.unmount(target);
                    return Err(failed(e));
                }
            }
            return Ok(());
        }

        if spec.fs_type == "overlay" {
            check_overlay(spec, target)?;
        }

        let data = if parsed.data.is_empty() {
            None
        } else {
            Some(CString::new(parsed.data).map_err(|e| invalid(target, e.to_string()))?)
        };
        mount(
            spec.source.as_str(),
            target,
            spec.fs_type.as_str(),
            parsed.flags,
            data.as_deref(),
        )
        .map_err(failed)
    }

    fn unmount(&self, target: &Path) -> FlarewrapResult<()> {
        use rustix::io::Errno;
        use rustix::mount::{UnmountFlags, unmount};

        tracing::debug!(target = %target.display(), "Unmounting filesystem");

        match unmount(target, UnmountFlags::empty()) {
            Ok(()) => Ok(()),
            Err(Errno::BUSY) => {
                tracing::warn!(target = %target.display(), "Mount busy, detaching lazily");
                unmount(target, UnmountFlags::DETACH).map_err(|e| {
                    FlarewrapError::from_mount("umount", target, e.into())
                })
            }
            Err(e) => Err(FlarewrapError::from_mount("umount", target, e.into())),
        }
    }
}
