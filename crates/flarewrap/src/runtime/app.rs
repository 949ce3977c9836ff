//! The toolkit facade.

use std::path::PathBuf;
use std::sync::Arc;

#[cfg(not(feature = "containerd"))]
use async_trait::async_trait;
use flarewrap_common::{FlarewrapError, FlarewrapResult, StorageLayout};
use flarewrap_image::{
    ContentSession, ContentStoreConnector, Image, ImageMetadata, ImageStore, KeyRegistry,
    SnapshotManager, discover_socket,
};

use super::{EventBus, FlarewrapConfig, Machine, MachineRecord, MachineStore, PipelineEvent};
use crate::filesystem::HostBackends;
use crate::host;
use crate::launch::{FirecrackerLauncher, LaunchedVm, Launcher};
use crate::pipeline::{PipelineError, RootfsArtifact, RootfsPipeline, RunOptions};

/// Entry point: images, machines, rootfs materialization and launch
/// over one working directory.
pub struct Flarewrap {
    config: FlarewrapConfig,
    layout: StorageLayout,
    images: ImageStore,
    machines: MachineStore,
    connector: Arc<dyn ContentStoreConnector>,
    backends: HostBackends,
    launcher: Arc<dyn Launcher>,
    registry: KeyRegistry,
    events: EventBus,
}

impl Flarewrap {
    /// Open a working directory with the default content-store backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the working
    /// directory structure cannot be created.
    pub fn new(config: FlarewrapConfig) -> FlarewrapResult<Self> {
        let connector = default_connector(&config);
        Self::with_connector(config, connector)
    }

    /// Open a working directory with an explicit content-store backend.
    ///
    /// # Errors
    ///
    /// See [`Self::new`].
    pub fn with_connector(
        config: FlarewrapConfig,
        connector: Arc<dyn ContentStoreConnector>,
    ) -> FlarewrapResult<Self> {
        config.validate()?;
        let layout = StorageLayout::new(&config.working_dir);
        layout.ensure_structure()?;

        tracing::debug!(working_dir = %layout.root().display(), "Opened working directory");
        Ok(Self {
            images: ImageStore::new(layout.clone()),
            machines: MachineStore::new(layout.clone()),
            launcher: Arc::new(FirecrackerLauncher::new(layout.clone())),
            backends: HostBackends::native(),
            registry: KeyRegistry::new(),
            events: EventBus::new(),
            layout,
            connector,
            config,
        })
    }

    /// Replace the mount, loop and format backends.
    #[must_use]
    pub fn with_backends(mut self, backends: HostBackends) -> Self {
        self.backends = backends;
        self
    }

    /// Replace the VM launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// The configuration in use.
    #[must_use]
    pub const fn config(&self) -> &FlarewrapConfig {
        &self.config
    }

    /// The working directory layout.
    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Pipeline and machine events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Register an image under a local logical name.
    ///
    /// Metadata for the name is written right away so machines can refer
    /// to the image by it. An earlier registration under the same name is
    /// replaced, unless it is for the same reference, in which case its
    /// pull record is kept.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid reference or name, or if the
    /// metadata cannot be written.
    pub fn new_image(&self, reference: &str, logical_name: &str) -> FlarewrapResult<Image> {
        self.layout.ensure_structure()?;
        let image = Image::new(reference, logical_name)?;

        let known = self
            .images
            .load(logical_name)
            .ok()
            .flatten()
            .is_some_and(|existing| existing.reference == *image.reference());
        if !known {
            self.images.save(&ImageMetadata::unpulled(&image))?;
        }

        tracing::info!(reference = %image.reference(), logical_name, "Image registered");
        Ok(image)
    }

    /// Whether an image's block file exists.
    #[must_use]
    pub fn image_exists(&self, image: &Image) -> bool {
        self.images.exists(image)
    }

    /// Describe a machine booting `image`.
    ///
    /// # Errors
    ///
    /// Returns an error for zero sizes or an invalid name.
    pub fn new_machine(
        &self,
        cpu_cores: u32,
        memory_mb: u64,
        storage_mb: u64,
        name: &str,
        image: &Image,
    ) -> FlarewrapResult<Machine> {
        Machine::for_image(cpu_cores, memory_mb, storage_mb, name, image)
    }

    /// Verify the hypervisor binary.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Precondition`] if it is unusable.
    pub async fn check_host(&self) -> FlarewrapResult<PathBuf> {
        host::check_hypervisor(&self.config.hypervisor, self.config.probe_timeout()).await
    }

    /// Find the content store and materialize `machine`'s rootfs.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`]; a missing content store fails before
    /// any work with stage `Idle`.
    pub async fn start(
        &self,
        machine: &Machine,
        options: RunOptions,
    ) -> Result<RootfsArtifact, PipelineError> {
        let socket = discover_socket(
            self.config.containerd_address.as_deref(),
            self.config.probe_timeout(),
        )
        .await
        .map_err(PipelineError::precondition)?;

        let options = match (options.deadline, self.config.pull_timeout()) {
            (None, Some(timeout)) => options.with_timeout(timeout),
            _ => options,
        };

        self.pipeline()
            .start(machine, &socket.display().to_string(), options)
            .await
    }

    /// The record a successful start left for `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read.
    pub fn machine(&self, name: &str) -> FlarewrapResult<Option<MachineRecord>> {
        self.machines.load(name)
    }

    /// Tear down a machine's rootfs and forget it.
    ///
    /// Block images are deleted. Direct-mount rootfs directories are
    /// unmounted and their snapshot removed. Releasing an unknown machine
    /// does nothing.
    ///
    /// # Errors
    ///
    /// Returns the first teardown failure; the record is kept then, so a
    /// later release can retry.
    pub async fn release(&self, name: &str) -> FlarewrapResult<()> {
        let Some(record) = self.machines.load(name)? else {
            tracing::debug!(machine = %name, "Nothing to release");
            return Ok(());
        };

        match &record.artifact {
            RootfsArtifact::BlockImage(image) => match std::fs::remove_file(&image.path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(FlarewrapError::Storage {
                        path: image.path.clone(),
                        source,
                    });
                }
            },
            RootfsArtifact::MountedDirectory { path, snapshot_key } => {
                if path.exists() {
                    if let Err(e) = self.backends.mounter.unmount(path) {
                        // An empty directory was never or is no longer mounted
                        let empty = std::fs::read_dir(path).map(|mut d| d.next().is_none()).unwrap_or(false);
                        if !empty {
                            return Err(e);
                        }
                    }
                    if let Err(e) = std::fs::remove_dir(path) {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to remove rootfs directory");
                    }
                }

                let session = self.connect().await?;
                let manager = SnapshotManager::new(
                    session.snapshots(&self.config.snapshotter),
                    self.registry.clone(),
                );
                let removed = manager.remove_key(snapshot_key).await;
                let closed = session.close().await;
                removed?;
                closed?;
            }
        }

        self.machines.delete(name)?;
        tracing::info!(machine = %name, "Machine released");
        self.events.publish(PipelineEvent::Released {
            machine: name.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        Ok(())
    }

    /// Boot a started machine from its block image.
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::Launch`] if the machine has no block
    /// image, and a precondition error if the hypervisor or kernel is
    /// unusable.
    pub async fn launch(&self, name: &str) -> FlarewrapResult<LaunchedVm> {
        let failed = |message: &str| FlarewrapError::Launch {
            machine: name.to_string(),
            message: message.to_string(),
        };

        let record = self
            .machines
            .load(name)?
            .ok_or_else(|| failed("no rootfs yet; start the machine first"))?;
        let RootfsArtifact::BlockImage(image) = &record.artifact else {
            return Err(failed("only block-image rootfs can be booted"));
        };

        let hypervisor = self.check_host().await?;
        let kernel = self.config.kernel();
        host::check_kernel(&kernel)?;

        let vm = self
            .launcher
            .launch(&record.machine, &image.path, &kernel, &hypervisor)
            .await?;
        self.events.publish(PipelineEvent::Launched {
            machine: name.to_string(),
            pid: vm.pid(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        Ok(vm)
    }

    fn pipeline(&self) -> RootfsPipeline {
        RootfsPipeline::new(
            self.config.clone(),
            self.connector.clone(),
            self.backends.clone(),
            self.registry.clone(),
            self.events.clone(),
        )
    }

    async fn connect(&self) -> FlarewrapResult<Box<dyn ContentSession>> {
        let socket = discover_socket(
            self.config.containerd_address.as_deref(),
            self.config.probe_timeout(),
        )
        .await?;
        self.connector.connect(&socket.display().to_string()).await
    }
}

impl std::fmt::Debug for Flarewrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flarewrap")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "containerd")]
fn default_connector(config: &FlarewrapConfig) -> Arc<dyn ContentStoreConnector> {
    Arc::new(flarewrap_image::ContainerdConnector::new(
        config.namespace.clone(),
        config.snapshotter.clone(),
    ))
}

#[cfg(not(feature = "containerd"))]
fn default_connector(_config: &FlarewrapConfig) -> Arc<dyn ContentStoreConnector> {
    Arc::new(NoContentStore)
}

/// Stand-in when built without a content-store backend.
#[cfg(not(feature = "containerd"))]
struct NoContentStore;

#[cfg(not(feature = "containerd"))]
#[async_trait]
impl ContentStoreConnector for NoContentStore {
    async fn connect(&self, _address: &str) -> FlarewrapResult<Box<dyn ContentSession>> {
        Err(FlarewrapError::Unsupported {
            feature: "containerd backend (rebuild with --features containerd)".to_string(),
        })
    }
}
