//! Rootfs materialization.
//!
//! One [`RootfsPipeline::start`] call walks a machine's image through
//! pull, snapshot, mount and (for block images) copy-out, recording every
//! acquired resource as it goes. Whatever happens, everything the run
//! acquired is released before it returns; only the final artifact
//! outlives it.

use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flarewrap_common::{
    FlarewrapError, FlarewrapResult, RunId, SnapshotErrorKind, SnapshotKey, StorageLayout,
    sanitize_component,
};
use flarewrap_image::{
    ContentSession, ContentStoreConnector, ImageStore, KeyRegistry, SnapshotHandle, SnapshotManager,
};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::lock::MachineLock;
use super::state::{PipelineState, Stage, StateTracker};
use crate::filesystem::{BlockImage, BlockImageBuilder, FilesystemCopier, HostBackends, LoopMount, MountScope};
use crate::runtime::{
    EventBus, FlarewrapConfig, Machine, MachineRecord, MachineStore, PipelineEvent, Strategy,
};

/// Caller controls for one start.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Cancels the run; the unwind still happens.
    pub cancel: CancellationToken,
    /// Cancels the run when reached.
    pub deadline: Option<Instant>,
}

impl RunOptions {
    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Give up after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// What a successful start delivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum RootfsArtifact {
    /// A standalone formatted image file.
    BlockImage(BlockImage),
    /// A live snapshot mount.
    MountedDirectory {
        /// Mounted rootfs directory.
        path: PathBuf,
        /// Snapshot backing the mount; remove it on release.
        snapshot_key: SnapshotKey,
    },
}

impl RootfsArtifact {
    /// Path to hand to the hypervisor (or to whoever uses the directory).
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::BlockImage(image) => &image.path,
            Self::MountedDirectory { path, .. } => path,
        }
    }
}

/// A failed start.
///
/// `source` is the first error of the run; failures hit while unwinding
/// are attached as related diagnostics and never replace it.
#[derive(Debug, Error, Diagnostic)]
#[error("Rootfs pipeline failed while {stage}")]
#[diagnostic(code(flarewrap::pipeline))]
pub struct PipelineError {
    /// Stage the run failed in.
    pub stage: Stage,
    /// The original error.
    #[source]
    #[diagnostic_source]
    pub source: FlarewrapError,
    /// Cleanup failures during the unwind.
    #[related]
    pub cleanup: Vec<FlarewrapError>,
}

impl PipelineError {
    /// A failure before the run acquired anything.
    #[must_use]
    pub const fn precondition(source: FlarewrapError) -> Self {
        Self {
            stage: Stage::Idle,
            source,
            cleanup: Vec::new(),
        }
    }
}

/// Everything a run holds, in acquisition order.
///
/// [`Acquired::unwind`] gives it all back in reverse.
#[derive(Default)]
struct Acquired {
    lock: Option<MachineLock>,
    session: Option<Box<dyn ContentSession>>,
    manager: Option<SnapshotManager>,
    snapshot: Option<SnapshotHandle>,
    scratch: Option<PathBuf>,
    snapshot_mount: Option<MountScope>,
    image_mount: Option<LoopMount>,
    mount_leaked: bool,
}

impl Acquired {
    async fn unwind(&mut self) -> Vec<FlarewrapError> {
        let mut failures = Vec::new();

        if let Some(mount) = self.image_mount.take() {
            if let Err(e) = mount.release() {
                self.mount_leaked = true;
                failures.push(e);
            }
        }

        if let Some(scope) = self.snapshot_mount.take() {
            if let Err(e) = scope.release() {
                self.mount_leaked = true;
                failures.push(e);
            }
        }

        if let Some(handle) = self.snapshot.take() {
            if let Some(manager) = &self.manager {
                if let Err(e) = manager.remove(handle).await {
                    failures.push(e);
                }
            }
        }
        self.manager = None;

        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                failures.push(e);
            }
        }

        if let Some(scratch) = self.scratch.take() {
            if self.mount_leaked {
                // Deleting through a live mount would wipe its contents
                tracing::warn!(path = %scratch.display(), "Keeping scratch directory with a mount still under it");
            } else if let Err(source) = fs::remove_dir_all(&scratch) {
                if source.kind() != std::io::ErrorKind::NotFound {
                    failures.push(FlarewrapError::Storage { path: scratch, source });
                }
            }
        }

        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release() {
                failures.push(e);
            }
        }

        failures
    }
}

/// Drives machines from image to rootfs artifact.
pub struct RootfsPipeline {
    config: FlarewrapConfig,
    layout: StorageLayout,
    images: ImageStore,
    machines: MachineStore,
    connector: Arc<dyn ContentStoreConnector>,
    backends: HostBackends,
    registry: KeyRegistry,
    events: EventBus,
}

impl RootfsPipeline {
    /// Create a pipeline.
    #[must_use]
    pub fn new(
        config: FlarewrapConfig,
        connector: Arc<dyn ContentStoreConnector>,
        backends: HostBackends,
        registry: KeyRegistry,
        events: EventBus,
    ) -> Self {
        let layout = StorageLayout::new(&config.working_dir);
        Self {
            images: ImageStore::new(layout.clone()),
            machines: MachineStore::new(layout.clone()),
            layout,
            config,
            connector,
            backends,
            registry,
            events,
        }
    }

    /// Materialize `machine`'s rootfs through the content store at
    /// `address`.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] naming the failed stage. By then every
    /// mount, snapshot, session, scratch directory and lock of the run has
    /// been released, or its release failure is listed in `cleanup`.
    pub async fn start(
        &self,
        machine: &Machine,
        address: &str,
        options: RunOptions,
    ) -> Result<RootfsArtifact, PipelineError> {
        let run = RunId::generate();
        let span = tracing::info_span!("rootfs", machine = %machine.name, run_id = %run);
        self.run(machine, address, options, run).instrument(span).await
    }

    async fn run(
        &self,
        machine: &Machine,
        address: &str,
        options: RunOptions,
        run: RunId,
    ) -> Result<RootfsArtifact, PipelineError> {
        let token = options.cancel.child_token();
        let deadline = options.deadline.map(|deadline| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                tracing::warn!("Start deadline reached, cancelling");
                token.cancel();
            })
        });

        let mut tracker = StateTracker::new(machine.name.as_str(), run.clone(), self.events.clone());
        let mut acquired = Acquired::default();
        let result = self
            .drive(machine, address, &run, &token, &mut tracker, &mut acquired)
            .await;

        if let Some(task) = deadline {
            task.abort();
        }

        match result {
            Ok(artifact) => Ok(artifact),
            Err(source) => {
                let stage = tracker.stage();
                let cleanup = acquired.unwind().await;
                for failure in &cleanup {
                    tracing::warn!(stage = %stage, error = %failure, "Cleanup failed during unwind");
                }
                tracker.fail();
                tracing::error!(stage = %stage, error = %source, "Rootfs pipeline failed");
                Err(PipelineError { stage, source, cleanup })
            }
        }
    }

    async fn drive(
        &self,
        machine: &Machine,
        address: &str,
        run: &RunId,
        token: &CancellationToken,
        tracker: &mut StateTracker,
        acquired: &mut Acquired,
    ) -> FlarewrapResult<RootfsArtifact> {
        let name = machine.name.as_str();
        let strategy = self.config.strategy;

        // Serialise identical requests before anything else is taken
        checkpoint(token, Stage::Idle)?;
        self.layout.ensure_structure()?;
        acquired.lock = Some(MachineLock::acquire(&self.layout.machine_lock(name), name)?);
        self.check_previous(machine)?;

        tracker.advance(PipelineState::Running(Stage::Pulling))?;
        let resolved = self.images.resolve(&machine.image)?;
        let session = cancellable(token, Stage::Pulling, self.connector.connect(address)).await?;
        let session = acquired.session.insert(session);
        let pulled = cancellable(token, Stage::Pulling, session.pull(&resolved.reference)).await?;
        let service = session.snapshots(&self.config.snapshotter);
        tracing::info!(
            reference = %pulled.reference,
            digest = %pulled.digest,
            chain_id = %pulled.chain_id,
            "Image pulled"
        );
        if let Some(logical) = &resolved.logical_name {
            if let Some(metadata) = self.images.load(logical.as_str())? {
                self.images.save(&metadata.with_pull(&pulled))?;
            }
        }

        tracker.advance(PipelineState::Running(Stage::SnapshotReady))?;
        checkpoint(token, Stage::SnapshotReady)?;
        let manager = SnapshotManager::new(service, self.registry.clone());
        acquired.manager = Some(manager.clone());
        let key = SnapshotKey::derive(&machine.name, &machine.image, run);
        let handle = match strategy {
            Strategy::BlockImage => manager.prepare_view(key, &pulled.chain_id).await?,
            Strategy::DirectMount => manager.prepare_writable(key, &pulled.chain_id).await?,
        };
        let handle = acquired.snapshot.insert(handle);

        tracker.advance(PipelineState::Running(Stage::Mounted))?;
        checkpoint(token, Stage::Mounted)?;
        let mounts = manager.mounts_for(handle).await?;
        let target = match strategy {
            Strategy::BlockImage => {
                let scratch = self.layout.run_scratch(run);
                fs::create_dir_all(&scratch).map_err(|source| FlarewrapError::Storage {
                    path: scratch.clone(),
                    source,
                })?;
                acquired.scratch = Some(scratch.clone());
                scratch.join("rootfs")
            }
            Strategy::DirectMount => self.layout.rootfs_dir(name, &sanitize_component(&machine.image)),
        };
        let scope = MountScope::acquire(self.backends.mounter.clone(), &mounts, &target)?;
        acquired.snapshot_mount = Some(scope);

        tracker.advance(PipelineState::Running(Stage::Materializing))?;
        let built = match strategy {
            Strategy::BlockImage => Some(self.materialize(machine, run, &target, token, acquired).await?),
            Strategy::DirectMount => None,
        };

        tracker.advance(PipelineState::Running(Stage::Finalizing))?;
        let artifact = match built {
            Some(image) => self.finalize_block_image(machine, run, image, acquired)?,
            None => self.finalize_direct_mount(machine, run, acquired)?,
        };

        // Only leftovers remain; snapshot removal and scratch cleanup are
        // best-effort on the success path
        for failure in acquired.unwind().await {
            tracing::warn!(error = %failure, "Cleanup failed after successful run");
        }

        tracker.advance(PipelineState::Done)?;
        tracing::info!(path = %artifact.path().display(), %strategy, "Rootfs ready");
        self.events.publish(PipelineEvent::RootfsReady {
            machine: name.to_string(),
            path: artifact.path().to_path_buf(),
            timestamp: Utc::now().timestamp(),
        });
        Ok(artifact)
    }

    /// Build a block image in the run's scratch and copy the snapshot in.
    async fn materialize(
        &self,
        machine: &Machine,
        run: &RunId,
        source: &Path,
        token: &CancellationToken,
        acquired: &mut Acquired,
    ) -> FlarewrapResult<BlockImage> {
        let scratch = self.layout.run_scratch(run);
        let builder = BlockImageBuilder::new(self.backends.clone());

        checkpoint(token, Stage::Materializing)?;
        let image = {
            let builder = builder.clone();
            let path = scratch.join(format!("rootfs.{}", self.config.filesystem_type));
            let fs_type = self.config.filesystem_type.clone();
            let size_mb = machine.storage_mb;
            blocking(move || builder.build(&path, size_mb, &fs_type)).await?
        };

        checkpoint(token, Stage::Materializing)?;
        let mount = builder.mount_loop(&image, &scratch.join("image"))?;
        let destination = mount.mount_point().to_path_buf();
        acquired.image_mount = Some(mount);

        let copier = FilesystemCopier::new().with_cancel(token.clone());
        let source = source.to_path_buf();
        let stats = blocking(move || copier.copy_tree(&source, &destination)).await?;
        tracing::info!(
            files = stats.files,
            directories = stats.directories,
            bytes = stats.bytes,
            "Rootfs copied into block image"
        );
        Ok(image)
    }

    fn finalize_block_image(
        &self,
        machine: &Machine,
        run: &RunId,
        image: BlockImage,
        acquired: &mut Acquired,
    ) -> FlarewrapResult<RootfsArtifact> {
        if let Some(mount) = acquired.image_mount.take() {
            if let Err(e) = mount.release() {
                acquired.mount_leaked = true;
                return Err(e);
            }
        }
        if let Some(scope) = acquired.snapshot_mount.take() {
            if let Err(e) = scope.release() {
                acquired.mount_leaked = true;
                return Err(e);
            }
        }

        let path = self.layout.rootfs_image(machine.name.as_str(), &image.fs_type);
        fs::rename(&image.path, &path).map_err(|source| FlarewrapError::Storage {
            path: path.clone(),
            source,
        })?;

        let artifact = RootfsArtifact::BlockImage(BlockImage { path, ..image });
        if let Err(e) = self.save_record(machine, run, &artifact) {
            if let Err(remove) = fs::remove_file(artifact.path()) {
                tracing::warn!(
                    path = %artifact.path().display(),
                    error = %remove,
                    "Failed to remove unrecorded block image"
                );
            }
            return Err(e);
        }
        Ok(artifact)
    }

    fn finalize_direct_mount(
        &self,
        machine: &Machine,
        run: &RunId,
        acquired: &mut Acquired,
    ) -> FlarewrapResult<RootfsArtifact> {
        let (Some(scope), Some(handle)) = (&acquired.snapshot_mount, &acquired.snapshot) else {
            return Err(FlarewrapError::Internal {
                message: format!("direct mount for {} lost its snapshot", machine.name),
            });
        };
        let artifact = RootfsArtifact::MountedDirectory {
            path: scope.target().to_path_buf(),
            snapshot_key: handle.key().clone(),
        };
        self.save_record(machine, run, &artifact)?;

        // The record owns the mount and the snapshot from here on
        if let Some(scope) = acquired.snapshot_mount.take() {
            let _path = scope.into_persistent();
        }
        if let (Some(handle), Some(manager)) = (acquired.snapshot.take(), &acquired.manager) {
            let _key = manager.keep(handle);
        }
        Ok(artifact)
    }

    /// Refuse to start over a rootfs this run would lose track of.
    ///
    /// A live direct-mount rootfs, or a block image somewhere other than
    /// where this run writes, is only reachable through its record.
    fn check_previous(&self, machine: &Machine) -> FlarewrapResult<()> {
        let name = machine.name.as_str();
        let Some(previous) = self.machines.load(name)? else {
            return Ok(());
        };

        let replaceable = match &previous.artifact {
            RootfsArtifact::BlockImage(image) => {
                self.config.strategy == Strategy::BlockImage
                    && image.path == self.layout.rootfs_image(name, &self.config.filesystem_type)
            }
            RootfsArtifact::MountedDirectory { .. } => false,
        };
        if replaceable {
            tracing::debug!(machine = %name, "Replacing previous block image");
            return Ok(());
        }

        Err(FlarewrapError::snapshot(
            name,
            SnapshotErrorKind::KeyInUse,
            format!(
                "machine already has a rootfs at {}; release it first",
                previous.artifact.path().display()
            ),
        ))
    }

    fn save_record(&self, machine: &Machine, run: &RunId, artifact: &RootfsArtifact) -> FlarewrapResult<()> {
        self.machines.save(&MachineRecord {
            machine: machine.clone(),
            strategy: self.config.strategy,
            artifact: artifact.clone(),
            run_id: run.to_string(),
            created_at: Utc::now(),
        })
    }
}

impl std::fmt::Debug for RootfsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootfsPipeline")
            .field("working_dir", &self.layout.root())
            .field("strategy", &self.config.strategy)
            .finish_non_exhaustive()
    }
}

fn cancelled(stage: Stage) -> FlarewrapError {
    FlarewrapError::Cancelled {
        stage: stage.to_string(),
    }
}

fn checkpoint(token: &CancellationToken, stage: Stage) -> FlarewrapResult<()> {
    if token.is_cancelled() {
        return Err(cancelled(stage));
    }
    Ok(())
}

/// Race `fut` against cancellation.
async fn cancellable<T>(
    token: &CancellationToken,
    stage: Stage,
    fut: impl Future<Output = FlarewrapResult<T>>,
) -> FlarewrapResult<T> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(cancelled(stage)),
        result = fut => result,
    }
}

async fn blocking<T, F>(f: F) -> FlarewrapResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> FlarewrapResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FlarewrapError::Internal {
            message: format!("blocking task failed: {e}"),
        })?
}
