//! Filesystem formatting through `mkfs.<type>`.

use std::path::Path;
use std::process::Command;

use flarewrap_common::{FlarewrapError, FlarewrapResult};

use super::Formatter;

/// [`Formatter`] that runs the host's `mkfs.<type>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MkfsFormatter;

impl MkfsFormatter {
    /// Flags that make the formatter run unattended on a regular file.
    #[must_use]
    pub fn batch_flags(fs_type: &str) -> &'static [&'static str] {
        match fs_type {
            "ext2" | "ext3" | "ext4" => &["-F", "-q"],
            "xfs" | "btrfs" => &["-f", "-q"],
            _ => &[],
        }
    }
}

impl Formatter for MkfsFormatter {
    fn format(&self, path: &Path, fs_type: &str) -> FlarewrapResult<()> {
        let failed = |message: String| FlarewrapError::Format {
            path: path.to_path_buf(),
            fs_type: fs_type.to_string(),
            message,
        };

        let program = format!("mkfs.{fs_type}");
        let binary = which::which(&program).map_err(|e| failed(format!("{program}: {e}")))?;

        tracing::debug!(binary = %binary.display(), path = %path.display(), "Formatting");
        let output = Command::new(&binary)
            .args(Self::batch_flags(fs_type))
            .arg(path)
            .output()
            .map_err(|e| failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failed(format!("{} exited with {}: {}", program, output.status, stderr.trim())));
        }

        Ok(())
    }
}
