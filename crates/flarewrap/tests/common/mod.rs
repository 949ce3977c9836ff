//! In-test fakes for the content store and the host backends.
//!
//! The fake content store serves images from plain directories and hands
//! out bind-mount specs for its snapshots. The fake host "mounts" by
//! copying a bind source into the target and "unmounts" by emptying it,
//! so pipeline runs need neither root nor containerd.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flarewrap::filesystem::{FilesystemCopier, Formatter, HostBackends, LoopAttacher, Mounter};
use flarewrap::runtime::{Flarewrap, FlarewrapConfig, Machine, Strategy};
use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec, SnapshotErrorKind};
use flarewrap_image::{ContentSession, ContentStoreConnector, ImageReference, PulledImage, SnapshotService};
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Where a fake should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    Connect,
    Pull,
    Prepare,
    BindMount,
    Format,
    Attach,
    LoopMount,
    /// The loop mount succeeds but its target refuses the copy.
    LoopWrite,
    LoopUnmount,
}

#[derive(Debug, Clone)]
struct FakeSnapshot {
    parent: String,
    readonly: bool,
}

/// Directory-backed content store.
#[derive(Default)]
pub struct FakeStore {
    images: Mutex<HashMap<String, PathBuf>>,
    snapshots: Mutex<HashMap<String, FakeSnapshot>>,
    fail: Mutex<Option<FailPoint>>,
    open_sessions: AtomicUsize,
    pulls: AtomicUsize,
    hold_pulls: Mutex<bool>,
    pull_started: Notify,
    pull_gate: Notify,
}

impl FakeStore {
    pub fn add_image(&self, reference: &str, root: &Path) {
        let reference = ImageReference::parse(reference).unwrap().full_reference();
        self.images.lock().insert(reference, root.to_path_buf());
    }

    pub fn fail_at(&self, point: FailPoint) {
        *self.fail.lock() = Some(point);
    }

    fn fails(&self, point: FailPoint) -> bool {
        *self.fail.lock() == Some(point)
    }

    pub fn snapshot_keys(&self) -> Vec<String> {
        self.snapshots.lock().keys().cloned().collect()
    }

    pub fn open_sessions(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    /// Park every pull until [`Self::release_pulls`].
    pub fn hold_pulls(&self) {
        *self.hold_pulls.lock() = true;
    }

    pub async fn wait_for_pull(&self) {
        self.pull_started.notified().await;
    }

    pub fn release_pulls(&self) {
        *self.hold_pulls.lock() = false;
        self.pull_gate.notify_waiters();
        self.pull_gate.notify_one();
    }

    fn chain_of(reference: &str) -> String {
        format!("sha256:chain-{}", flarewrap_common::sanitize_component(reference))
    }

    fn root_of_chain(&self, chain: &str) -> Option<PathBuf> {
        self.images
            .lock()
            .iter()
            .find(|(reference, _)| Self::chain_of(reference) == chain)
            .map(|(_, root)| root.clone())
    }

    fn spec_for(&self, key: &str) -> FlarewrapResult<Vec<MountSpec>> {
        let snapshot = self.snapshots.lock().get(key).cloned().ok_or_else(|| {
            FlarewrapError::snapshot(key, SnapshotErrorKind::NotFound, "no such snapshot")
        })?;
        let root = self.root_of_chain(&snapshot.parent).ok_or_else(|| {
            FlarewrapError::snapshot(key, SnapshotErrorKind::NotFound, "parent not unpacked")
        })?;
        Ok(vec![MountSpec::bind(&root, snapshot.readonly)])
    }

    fn create(&self, key: &str, parent: &str, readonly: bool) -> FlarewrapResult<Vec<MountSpec>> {
        if self.fails(FailPoint::Prepare) {
            return Err(FlarewrapError::snapshot(key, SnapshotErrorKind::Backend, "snapshotter broken"));
        }
        {
            let mut snapshots = self.snapshots.lock();
            if snapshots.contains_key(key) {
                return Err(FlarewrapError::snapshot(key, SnapshotErrorKind::KeyInUse, "exists"));
            }
            snapshots.insert(
                key.to_string(),
                FakeSnapshot {
                    parent: parent.to_string(),
                    readonly,
                },
            );
        }
        self.spec_for(key)
    }
}

pub struct FakeConnector(pub Arc<FakeStore>);

#[async_trait]
impl ContentStoreConnector for FakeConnector {
    async fn connect(&self, address: &str) -> FlarewrapResult<Box<dyn ContentSession>> {
        if self.0.fails(FailPoint::Connect) {
            return Err(FlarewrapError::Connection {
                address: address.to_string(),
                message: "refused".to_string(),
            });
        }
        self.0.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession(self.0.clone())))
    }
}

struct FakeSession(Arc<FakeStore>);

#[async_trait]
impl ContentSession for FakeSession {
    async fn pull(&self, reference: &ImageReference) -> FlarewrapResult<PulledImage> {
        let store = &self.0;
        if *store.hold_pulls.lock() {
            store.pull_started.notify_one();
            store.pull_gate.notified().await;
        }

        let full = reference.full_reference();
        if store.fails(FailPoint::Pull) || !store.images.lock().contains_key(&full) {
            return Err(FlarewrapError::Pull {
                reference: full,
                message: "not found in registry".to_string(),
            });
        }

        store.pulls.fetch_add(1, Ordering::SeqCst);
        Ok(PulledImage {
            reference: reference.clone(),
            digest: format!("sha256:manifest-{}", flarewrap_common::sanitize_component(&full)),
            chain_id: FakeStore::chain_of(&full),
        })
    }

    fn snapshots(&self, _snapshotter: &str) -> Arc<dyn SnapshotService> {
        Arc::new(FakeSnapshots(self.0.clone()))
    }

    async fn close(&self) -> FlarewrapResult<()> {
        self.0.open_sessions.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeSnapshots(Arc<FakeStore>);

#[async_trait]
impl SnapshotService for FakeSnapshots {
    async fn prepare(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>> {
        self.0.create(key, parent, false)
    }

    async fn view(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>> {
        self.0.create(key, parent, true)
    }

    async fn mounts(&self, key: &str) -> FlarewrapResult<Vec<MountSpec>> {
        self.0.spec_for(key)
    }

    async fn remove(&self, key: &str) -> FlarewrapResult<()> {
        self.0.snapshots.lock().remove(key).map(|_| ()).ok_or_else(|| {
            FlarewrapError::snapshot(key, SnapshotErrorKind::NotFound, "no such snapshot")
        })
    }
}

/// Mount, loop and mkfs emulation.
#[derive(Default)]
pub struct FakeHost {
    fail: Mutex<Option<FailPoint>>,
    mounts: Mutex<Vec<PathBuf>>,
    loops: Mutex<HashMap<PathBuf, PathBuf>>,
    formatted: Mutex<HashSet<PathBuf>>,
    /// Relative paths seen inside each loop mount when it was unmounted.
    captured: Mutex<Vec<Vec<String>>>,
    next_loop: AtomicUsize,
    cancel_on_format: Mutex<Option<CancellationToken>>,
}

impl FakeHost {
    pub fn fail_at(&self, point: FailPoint) {
        *self.fail.lock() = Some(point);
    }

    fn fails(&self, point: FailPoint) -> bool {
        *self.fail.lock() == Some(point)
    }

    /// Cancel `token` once the block image has been formatted.
    pub fn cancel_after_format(&self, token: CancellationToken) {
        *self.cancel_on_format.lock() = Some(token);
    }

    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.mounts.lock().clone()
    }

    pub fn attached_loops(&self) -> usize {
        self.loops.lock().len()
    }

    pub fn captured(&self) -> Vec<Vec<String>> {
        self.captured.lock().clone()
    }

    fn denied(target: &Path) -> FlarewrapError {
        FlarewrapError::from_mount(
            "mount",
            target,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        )
    }
}

impl Mounter for FakeHost {
    fn mount(&self, spec: &MountSpec, target: &Path) -> FlarewrapResult<()> {
        if spec.is_bind() {
            if self.fails(FailPoint::BindMount) {
                return Err(Self::denied(target));
            }
            FilesystemCopier::new().copy_tree(Path::new(&spec.source), target)?;
        } else {
            if self.fails(FailPoint::LoopMount) {
                return Err(Self::denied(target));
            }
            if !self.loops.lock().contains_key(Path::new(&spec.source)) {
                return Err(FlarewrapError::from_mount(
                    "mount",
                    target,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
            if self.fails(FailPoint::LoopWrite) {
                // A regular file where the rootfs needs a directory
                fs::write(target.join("etc"), "").unwrap();
            }
        }
        self.mounts.lock().push(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> FlarewrapResult<()> {
        let is_loop = target.ends_with("image");
        if is_loop && self.fails(FailPoint::LoopUnmount) {
            return Err(FlarewrapError::from_mount(
                "unmount",
                target,
                std::io::Error::from(std::io::ErrorKind::ResourceBusy),
            ));
        }

        {
            let mut mounts = self.mounts.lock();
            let Some(pos) = mounts.iter().position(|m| m == target) else {
                return Err(FlarewrapError::from_mount(
                    "unmount",
                    target,
                    std::io::Error::from(std::io::ErrorKind::InvalidInput),
                ));
            };
            mounts.remove(pos);
        }

        if is_loop {
            self.captured.lock().push(listing(target));
        }
        empty_dir(target);
        Ok(())
    }
}

impl LoopAttacher for FakeHost {
    fn attach(&self, file: &Path) -> FlarewrapResult<PathBuf> {
        if self.fails(FailPoint::Attach) {
            return Err(FlarewrapError::Privilege {
                operation: "loop attach".to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }
        if !self.formatted.lock().contains(file) {
            return Err(FlarewrapError::Internal {
                message: format!("{} attached before formatting", file.display()),
            });
        }
        let device = PathBuf::from(format!("/dev/fakeloop{}", self.next_loop.fetch_add(1, Ordering::SeqCst)));
        self.loops.lock().insert(device.clone(), file.to_path_buf());
        Ok(device)
    }

    fn detach(&self, device: &Path) -> FlarewrapResult<()> {
        self.loops.lock().remove(device);
        Ok(())
    }
}

impl Formatter for FakeHost {
    fn format(&self, path: &Path, fs_type: &str) -> FlarewrapResult<()> {
        if self.fails(FailPoint::Format) {
            return Err(FlarewrapError::Format {
                path: path.to_path_buf(),
                fs_type: fs_type.to_string(),
                message: "mkfs exploded".to_string(),
            });
        }
        self.formatted.lock().insert(path.to_path_buf());
        if let Some(token) = self.cancel_on_format.lock().as_ref() {
            token.cancel();
        }
        Ok(())
    }
}

/// Sorted relative paths under `root`.
pub fn listing(root: &Path) -> Vec<String> {
    let mut paths: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|e| e.path().strip_prefix(root).ok().map(|p| p.display().to_string()))
        .collect();
    paths.sort();
    paths
}

fn empty_dir(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            let _ = fs::remove_dir_all(&path);
        } else {
            let _ = fs::remove_file(&path);
        }
    }
}

/// A tiny Alpine-looking tree.
pub fn alpine_tree(root: &Path) {
    fs::create_dir_all(root.join("etc")).unwrap();
    fs::create_dir_all(root.join("bin")).unwrap();
    fs::create_dir_all(root.join("tmp")).unwrap();
    fs::write(root.join("etc/os-release"), "ID=alpine\nVERSION_ID=3.19.1\n").unwrap();
    fs::write(root.join("bin/busybox"), b"\x7fELF busybox").unwrap();
    fs::set_permissions(root.join("bin/busybox"), fs::Permissions::from_mode(0o755)).unwrap();
    symlink("busybox", root.join("bin/sh")).unwrap();
    fs::set_permissions(root.join("tmp"), fs::Permissions::from_mode(0o1777)).unwrap();
}

/// A working directory, fakes and a facade wired to them.
pub struct Harness {
    pub temp: TempDir,
    pub store: Arc<FakeStore>,
    pub host: Arc<FakeHost>,
    pub app: Flarewrap,
    _socket: UnixListener,
}

impl Harness {
    /// Needs a tokio runtime (binds the fake content-store socket).
    pub fn new(strategy: Strategy) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let source = temp.path().join("source-alpine");
        alpine_tree(&source);

        let store = Arc::new(FakeStore::default());
        store.add_image("alpine:latest", &source);
        let host = Arc::new(FakeHost::default());

        let socket_path = temp.path().join("containerd.sock");
        let socket = UnixListener::bind(&socket_path).unwrap();

        let config = FlarewrapConfig::default()
            .with_working_dir(temp.path().join("working"))
            .with_containerd_address(&socket_path)
            .with_strategy(strategy);
        let app = Flarewrap::with_connector(config, Arc::new(FakeConnector(store.clone())))
            .unwrap()
            .with_backends(HostBackends {
                mounter: host.clone(),
                loops: host.clone(),
                formatter: host.clone(),
            });

        Self {
            temp,
            store,
            host,
            app,
            _socket: socket,
        }
    }

    /// Machine `name` on the registered `alpine` image, 4 MB of storage.
    pub fn machine(&self, name: &str) -> Machine {
        let image = self.app.new_image("alpine:latest", "alpine").unwrap();
        self.app.new_machine(1, 128, 4, name, &image).unwrap()
    }

    pub fn temp_entries(&self) -> usize {
        fs::read_dir(self.app.layout().temp()).unwrap().count()
    }

    pub fn lock_exists(&self, name: &str) -> bool {
        self.app.layout().machine_lock(name).exists()
    }

    /// Nothing from any run is still held.
    pub fn assert_all_released(&self, name: &str) {
        assert!(self.host.active_mounts().is_empty(), "mounts: {:?}", self.host.active_mounts());
        assert_eq!(self.host.attached_loops(), 0);
        assert_eq!(self.store.open_sessions(), 0);
        assert_eq!(self.temp_entries(), 0);
        assert!(!self.lock_exists(name));
    }
}
