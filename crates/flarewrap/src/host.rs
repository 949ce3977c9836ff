//! Host preconditions: the hypervisor binary and the guest kernel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use flarewrap_common::{FlarewrapError, FlarewrapResult};

/// Locate the hypervisor and make sure it runs.
///
/// `binary` is looked up on `PATH` unless it already is a path. The
/// binary must answer `--version` with a zero exit within `timeout`.
///
/// # Errors
///
/// Returns [`FlarewrapError::Precondition`] if the binary is missing,
/// cannot be run, exits non-zero or hangs.
pub async fn check_hypervisor(binary: &str, timeout: Duration) -> FlarewrapResult<PathBuf> {
    let failed = |message: String| FlarewrapError::Precondition {
        what: format!("hypervisor '{binary}'"),
        message,
    };

    let path = which::which(binary).map_err(|e| failed(format!("not found: {e}")))?;

    let mut command = tokio::process::Command::new(&path);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(failed(format!("cannot run {}: {e}", path.display()))),
        Err(_) => return Err(failed(format!("version query did not finish within {timeout:?}"))),
    };

    if !output.status.success() {
        return Err(failed(format!("version query exited with {}", output.status)));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next().unwrap_or_default().trim();
    tracing::info!(path = %path.display(), version, "Hypervisor found");
    Ok(path)
}

/// Make sure the guest kernel is a regular file.
///
/// # Errors
///
/// Returns [`FlarewrapError::Precondition`] otherwise.
pub fn check_kernel(path: &Path) -> FlarewrapResult<()> {
    if path.is_file() {
        tracing::debug!(path = %path.display(), "Kernel found");
        return Ok(());
    }
    Err(FlarewrapError::Precondition {
        what: "kernel image".to_string(),
        message: format!("{} is not a file", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn working_binary_is_accepted() {
        let temp = tempfile::tempdir().unwrap();
        let fake = script(temp.path(), "firecracker", "echo 'Firecracker v1.7.0'");

        let found = check_hypervisor(fake.to_str().unwrap(), Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(found, fake);
    }

    #[tokio::test]
    async fn missing_failing_and_hanging_binaries_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let failing = script(temp.path(), "failing", "exit 3");
        let hanging = script(temp.path(), "hanging", "sleep 5");

        for binary in [
            "flarewrap-no-such-hypervisor".to_string(),
            failing.display().to_string(),
            hanging.display().to_string(),
        ] {
            let err = check_hypervisor(&binary, Duration::from_millis(300))
                .await
                .unwrap_err();
            assert!(matches!(err, FlarewrapError::Precondition { .. }), "{binary}: {err}");
        }
    }

    #[test]
    fn kernel_must_be_a_file() {
        let temp = tempfile::tempdir().unwrap();
        assert!(check_kernel(temp.path()).is_err());
        assert!(check_kernel(&temp.path().join("vmlinux")).is_err());

        std::fs::write(temp.path().join("vmlinux"), b"\x7fELF").unwrap();
        check_kernel(&temp.path().join("vmlinux")).unwrap();
    }
}
