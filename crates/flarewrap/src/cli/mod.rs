//! CLI definition and handler.

use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::Result;
use flarewrap_common::{FlarewrapResult, sanitize_component};
use flarewrap_image::ImageReference;
use tokio_util::sync::CancellationToken;

use crate::pipeline::RunOptions;
use crate::runtime::{Flarewrap, FlarewrapConfig, Strategy};

/// Flarewrap - OCI images to microVM root filesystems
#[derive(Parser, Debug)]
#[command(name = "flarewrap")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Working directory for images, machines, logs and rootfs
    #[arg(long, env = "FLAREWRAP_WORKING_DIR")]
    pub working_dir: Option<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, env = "FLAREWRAP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Image to build a rootfs from; without it only host checks run
    #[arg(long)]
    pub image: Option<String>,

    /// Machine name
    #[arg(long, default_value = "default")]
    pub name: String,

    /// Virtual CPUs
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    /// Memory in MB
    #[arg(long, default_value_t = 512)]
    pub memory: u64,

    /// Root drive size in MB
    #[arg(long, default_value_t = 5120)]
    pub storage: u64,

    /// Rootfs strategy (block-image, direct-mount)
    #[arg(long)]
    pub strategy: Option<Strategy>,

    /// Guest kernel image
    #[arg(long, env = "FLAREWRAP_KERNEL")]
    pub kernel: Option<PathBuf>,

    /// Hypervisor binary name or path
    #[arg(long, env = "FLAREWRAP_HYPERVISOR")]
    pub hypervisor: Option<String>,

    /// containerd socket
    #[arg(long, env = "FLAREWRAP_CONTAINERD")]
    pub containerd: Option<PathBuf>,

    /// Boot the VM once the rootfs is ready
    #[arg(long)]
    pub launch: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Build the configuration: defaults, then the config file, then
    /// flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or a value is invalid.
    pub fn resolve_config(&self) -> FlarewrapResult<FlarewrapConfig> {
        let mut config = match &self.config {
            Some(path) => FlarewrapConfig::load(path)?,
            None => FlarewrapConfig::default(),
        };

        if let Some(dir) = &self.working_dir {
            config = config.with_working_dir(dir);
        }
        if let Some(strategy) = self.strategy {
            config = config.with_strategy(strategy);
        }
        if let Some(kernel) = &self.kernel {
            config = config.with_kernel(kernel);
        }
        if let Some(hypervisor) = &self.hypervisor {
            config = config.with_hypervisor(hypervisor);
        }
        if let Some(socket) = &self.containerd {
            config = config.with_containerd_address(socket);
        }

        config.validate()?;
        Ok(config)
    }

    /// Run the checks and, with `--image`, one start.
    ///
    /// # Errors
    ///
    /// Returns the first precondition or pipeline failure.
    pub async fn execute(self, config: FlarewrapConfig) -> Result<()> {
        let app = Flarewrap::new(config)?;

        let hypervisor = app.check_host().await?;
        println!("Hypervisor found at {}", hypervisor.display());

        let Some(reference) = self.image.as_deref() else {
            println!("Host checks passed");
            return Ok(());
        };

        let image = app.new_image(reference, &logical_name_for(reference))?;
        let machine = app.new_machine(self.cpus, self.memory, self.storage, &self.name, &image)?;

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, unwinding");
                    cancel.cancel();
                }
            });
        }

        let artifact = match app.start(&machine, RunOptions::default().with_cancel(cancel)).await {
            Ok(artifact) => artifact,
            Err(e) => {
                for failure in &e.cleanup {
                    eprintln!("cleanup failed: {failure}");
                }
                return Err(e.into());
            }
        };
        println!("Rootfs for {} ready at {}", machine.name, artifact.path().display());

        if self.launch {
            let vm = app.launch(machine.name.as_str()).await?;
            println!(
                "VM {} started (pid {}), log at {}",
                machine.name,
                vm.pid(),
                vm.log_path().display()
            );
        }

        Ok(())
    }
}

/// Local alias for an image: the last repository component.
///
/// `docker.io/library/alpine:3.19` becomes `alpine`.
#[must_use]
pub fn logical_name_for(reference: &str) -> String {
    ImageReference::parse(reference)
        .ok()
        .and_then(|r| r.repository.rsplit('/').next().map(sanitize_component))
        .filter(|name| name.starts_with(|c: char| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "image".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "flarewrap",
            "--working-dir",
            "/srv/fw",
            "--strategy",
            "direct-mount",
            "--hypervisor",
            "/opt/fc/firecracker",
        ]);
        let config = cli.resolve_config().unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/srv/fw"));
        assert_eq!(config.strategy, Strategy::DirectMount);
        assert_eq!(config.hypervisor, "/opt/fc/firecracker");
        assert_eq!(cli.name, "default");
        assert_eq!(cli.storage, 5120);
    }

    #[test]
    fn unknown_strategy_is_a_usage_error() {
        assert!(Cli::try_parse_from(["flarewrap", "--strategy", "copy"]).is_err());
    }

    #[test]
    fn logical_names() {
        assert_eq!(logical_name_for("alpine:latest"), "alpine");
        assert_eq!(logical_name_for("ghcr.io/acme/web-app@sha256:abc"), "web-app");
        assert_eq!(logical_name_for("::"), "image");
    }
}
