//! VM launch.
//!
//! The pipeline ends at a rootfs artifact; starting the microVM on top of
//! it is a separate step behind [`Launcher`].

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use flarewrap_common::{FlarewrapError, FlarewrapResult, StorageLayout};
use serde::Serialize;

use crate::runtime::Machine;

/// Kernel command line for a serial console and no PCI.
pub const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// Starts a microVM from a rootfs.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Boot `machine` from `rootfs` with `kernel` using `hypervisor`.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Launch`] if the VM process cannot be
    /// started.
    async fn launch(
        &self,
        machine: &Machine,
        rootfs: &Path,
        kernel: &Path,
        hypervisor: &Path,
    ) -> FlarewrapResult<LaunchedVm>;
}

/// A running hypervisor process.
#[derive(Debug)]
pub struct LaunchedVm {
    child: tokio::process::Child,
    pid: u32,
    config_path: PathBuf,
    log_path: PathBuf,
}

impl LaunchedVm {
    /// Process id.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Hypervisor configuration written for this VM.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Where the hypervisor's output goes.
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Wait for the VM to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    pub async fn wait(&mut self) -> FlarewrapResult<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Kill the VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    pub async fn kill(&mut self) -> FlarewrapResult<()> {
        Ok(self.child.kill().await?)
    }
}

#[derive(Debug, Serialize)]
struct VmConfig {
    #[serde(rename = "boot-source")]
    boot_source: BootSource,
    drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    machine_config: MachineConfig,
}

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: PathBuf,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct Drive {
    drive_id: String,
    path_on_host: PathBuf,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u64,
}

/// Launches Firecracker without its API socket, from a config file.
#[derive(Debug, Clone)]
pub struct FirecrackerLauncher {
    layout: StorageLayout,
    boot_args: String,
}

impl FirecrackerLauncher {
    /// Create a launcher writing configs and logs under `layout`.
    #[must_use]
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
        }
    }

    /// Override the kernel command line.
    #[must_use]
    pub fn with_boot_args(mut self, boot_args: impl Into<String>) -> Self {
        self.boot_args = boot_args.into();
        self
    }

    fn config(&self, machine: &Machine, rootfs: &Path, kernel: &Path) -> VmConfig {
        VmConfig {
            boot_source: BootSource {
                kernel_image_path: kernel.to_path_buf(),
                boot_args: self.boot_args.clone(),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs.to_path_buf(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count: machine.cpu_cores,
                mem_size_mib: machine.memory_mb,
            },
        }
    }
}

#[async_trait]
impl Launcher for FirecrackerLauncher {
    async fn launch(
        &self,
        machine: &Machine,
        rootfs: &Path,
        kernel: &Path,
        hypervisor: &Path,
    ) -> FlarewrapResult<LaunchedVm> {
        let name = machine.name.as_str();
        let failed = |message: String| FlarewrapError::Launch {
            machine: name.to_string(),
            message,
        };

        let dir = self.layout.machine_dir(name);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(self.layout.logs())?;

        let config_path = dir.join("firecracker.json");
        let json = serde_json::to_string_pretty(&self.config(machine, rootfs, kernel))?;
        std::fs::write(&config_path, json)?;

        let log_path = self.layout.machine_log(name);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let log_err = log.try_clone()?;

        let child = tokio::process::Command::new(hypervisor)
            .arg("--no-api")
            .arg("--config-file")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| failed(format!("cannot spawn {}: {e}", hypervisor.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| failed("hypervisor exited before reporting a pid".to_string()))?;

        tracing::info!(
            machine = %name,
            pid,
            config = %config_path.display(),
            log = %log_path.display(),
            "VM launched"
        );

        Ok(LaunchedVm {
            child,
            pid,
            config_path,
            log_path,
        })
    }
}
