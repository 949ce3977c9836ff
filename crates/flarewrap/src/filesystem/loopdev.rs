#![allow(unsafe_code)]
//! Loop device control.

use std::fs::{File, OpenOptions};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use flarewrap_common::{FlarewrapError, FlarewrapResult};

use super::LoopAttacher;

const LOOP_CONTROL: &str = "/dev/loop-control";

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

const LO_FLAGS_AUTOCLEAR: u32 = 4;
const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

/// Attempts before giving up on a device another process grabbed first.
const ATTACH_ATTEMPTS: usize = 8;

/// `struct loop_info64` from `<linux/loop.h>`.
#[repr(C)]
#[allow(dead_code)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl LoopInfo64 {
    fn autoclear(backing: &Path) -> Self {
        let mut info = Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: LO_FLAGS_AUTOCLEAR,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        };
        let name = backing.as_os_str().as_bytes();
        let len = name.len().min(LO_NAME_SIZE - 1);
        info.lo_file_name[..len].copy_from_slice(&name[..len]);
        info
    }
}

/// [`LoopAttacher`] using `/dev/loop-control` ioctls.
#[derive(Debug, Clone, Default)]
pub struct LoopControl;

fn loop_error(operation: &str, target: &Path, err: std::io::Error) -> FlarewrapError {
    FlarewrapError::from_mount(operation, target, err)
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

impl LoopControl {
    fn next_free(control: &File) -> FlarewrapResult<PathBuf> {
        // Safety: LOOP_CTL_GET_FREE takes no argument
        let nr = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        if nr < 0 {
            return Err(loop_error(
                "allocate loop device",
                Path::new(LOOP_CONTROL),
                std::io::Error::last_os_error(),
            ));
        }
        Ok(PathBuf::from(format!("/dev/loop{nr}")))
    }

    fn bind(device: &Path, backing: &File, backing_path: &Path) -> FlarewrapResult<bool> {
        let dev = open_rw(device).map_err(|e| loop_error("open loop device", device, e))?;

        // Safety: LOOP_SET_FD takes the backing descriptor by value
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd()) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EBUSY) {
                return Ok(false);
            }
            return Err(loop_error("attach loop device", device, err));
        }

        let info = LoopInfo64::autoclear(backing_path);
        // Safety: info is a valid loop_info64 for the duration of the call
        let ret = unsafe {
            libc::ioctl(
                dev.as_raw_fd(),
                LOOP_SET_STATUS64 as _,
                std::ptr::from_ref(&info),
            )
        };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // Safety: LOOP_CLR_FD takes no argument
            unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_CLR_FD as _) };
            return Err(loop_error("configure loop device", device, err));
        }

        Ok(true)
    }
}

impl LoopAttacher for LoopControl {
    fn attach(&self, file: &Path) -> FlarewrapResult<PathBuf> {
        let control = open_rw(Path::new(LOOP_CONTROL))
            .map_err(|e| loop_error("open loop control", Path::new(LOOP_CONTROL), e))?;
        let backing = open_rw(file).map_err(|e| loop_error("open backing file", file, e))?;

        for _ in 0..ATTACH_ATTEMPTS {
            let device = Self::next_free(&control)?;
            if Self::bind(&device, &backing, file)? {
                tracing::debug!(file = %file.display(), device = %device.display(), "Loop device attached");
                return Ok(device);
            }
            tracing::debug!(device = %device.display(), "Loop device taken, retrying");
        }

        Err(loop_error(
            "attach loop device",
            file,
            std::io::Error::from_raw_os_error(libc::EBUSY),
        ))
    }

    fn detach(&self, device: &Path) -> FlarewrapResult<()> {
        let dev = match open_rw(device) {
            Ok(dev) => dev,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(loop_error("open loop device", device, e)),
        };

        // Safety: LOOP_CLR_FD takes no argument
        let ret = unsafe { libc::ioctl(dev.as_raw_fd(), LOOP_CLR_FD as _) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            // Autoclear already released it
            if err.raw_os_error() == Some(libc::ENXIO) {
                return Ok(());
            }
            return Err(loop_error("detach loop device", device, err));
        }

        tracing::debug!(device = %device.display(), "Loop device detached");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_info_layout_matches_kernel() {
        assert_eq!(std::mem::size_of::<LoopInfo64>(), 232);
    }

    #[test]
    fn file_name_is_truncated_and_terminated() {
        let long = PathBuf::from("/".repeat(100));
        let info = LoopInfo64::autoclear(&long);
        assert_eq!(info.lo_file_name[LO_NAME_SIZE - 1], 0);
        assert_eq!(info.lo_flags, LO_FLAGS_AUTOCLEAR);
    }
}
