//! containerd backend for the content-store boundary.

use std::sync::Arc;

use async_trait::async_trait;
use containerd_client::services::v1::snapshots::{
    MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest, ViewSnapshotRequest,
};
use containerd_client::services::v1::{
    GetImageRequest, ReadContentRequest, TransferOptions, TransferRequest,
};
use containerd_client::tonic::{Code, Request, Status};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::{Mount, Platform as ProtoPlatform};
use containerd_client::{Client, to_any, with_namespace};
use flarewrap_common::{FlarewrapError, FlarewrapResult, MountSpec, SnapshotErrorKind};

use crate::content::{ContentSession, ContentStoreConnector, SnapshotService};
use crate::image::PulledImage;
use crate::oci::{self, ImageConfig, ManifestOrIndex, Platform};
use crate::reference::ImageReference;

/// Connects to containerd over its gRPC socket.
#[derive(Debug, Clone)]
pub struct ContainerdConnector {
    namespace: String,
    snapshotter: String,
}

impl ContainerdConnector {
    /// Create a connector scoped to a containerd namespace.
    ///
    /// Pulls unpack into `snapshotter`, which must be the one snapshots
    /// are later prepared from.
    pub fn new(namespace: impl Into<String>, snapshotter: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            snapshotter: snapshotter.into(),
        }
    }
}

#[async_trait]
impl ContentStoreConnector for ContainerdConnector {
    async fn connect(&self, address: &str) -> FlarewrapResult<Box<dyn ContentSession>> {
        let client = Client::from_path(address)
            .await
            .map_err(|e| FlarewrapError::Connection {
                address: address.to_string(),
                message: e.to_string(),
            })?;

        tracing::debug!(address, namespace = %self.namespace, "Connected to containerd");
        Ok(Box::new(ContainerdSession {
            client: Arc::new(client),
            namespace: self.namespace.clone(),
            snapshotter: self.snapshotter.clone(),
        }))
    }
}

/// A live containerd connection.
pub struct ContainerdSession {
    client: Arc<Client>,
    namespace: String,
    snapshotter: String,
}

impl ContainerdSession {
    async fn read_blob(&self, digest: &str) -> FlarewrapResult<Vec<u8>> {
        let req = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let req = with_namespace!(req, self.namespace.as_str());

        let mut stream = self
            .client
            .content()
            .read(req)
            .await
            .map_err(|s| pull_error(digest, &s))?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream.message().await.map_err(|s| pull_error(digest, &s))? {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    /// Walk index → manifest → config and fold the diff ids.
    async fn resolve_chain_id(&self, target_digest: &str) -> FlarewrapResult<String> {
        let mut manifest_digest = target_digest.to_string();
        let manifest = loop {
            let blob = self.read_blob(&manifest_digest).await?;
            match ManifestOrIndex::parse(&blob)? {
                ManifestOrIndex::Manifest(manifest) => break manifest,
                ManifestOrIndex::Index(index) => {
                    manifest_digest = oci::select_manifest(&index, &Platform::host())?.digest.clone();
                }
            }
        };

        let config: ImageConfig = serde_json::from_slice(&self.read_blob(&manifest.config.digest).await?)?;
        oci::chain_id(&config.rootfs.diff_ids)
    }
}

#[async_trait]
impl ContentSession for ContainerdSession {
    async fn pull(&self, reference: &ImageReference) -> FlarewrapResult<PulledImage> {
        let name = reference.full_reference();
        let host = Platform::host();
        let platform = ProtoPlatform {
            os: host.os,
            architecture: host.architecture,
            ..Default::default()
        };

        let source = OciRegistry {
            reference: name.clone(),
            ..Default::default()
        };
        let destination = ImageStore {
            name: name.clone(),
            platforms: vec![platform.clone()],
            unpacks: vec![unpack_config(platform, &self.snapshotter)],
            ..Default::default()
        };
        let req = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: Some(TransferOptions::default()),
        };

        tracing::info!(image = %name, "Pulling image");
        self.client
            .transfer()
            .transfer(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| pull_error(&name, &s))?;

        let req = GetImageRequest { name: name.clone() };
        let image = self
            .client
            .images()
            .get(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| pull_error(&name, &s))?
            .into_inner()
            .image
            .and_then(|i| i.target)
            .ok_or_else(|| FlarewrapError::Pull {
                reference: name.clone(),
                message: "image has no target after pull".to_string(),
            })?;

        let chain_id = self.resolve_chain_id(&image.digest).await?;
        tracing::info!(image = %name, digest = %image.digest, chain_id = %chain_id, "Image unpacked");

        Ok(PulledImage {
            reference: reference.clone(),
            digest: image.digest,
            chain_id,
        })
    }

    fn snapshots(&self, snapshotter: &str) -> Arc<dyn SnapshotService> {
        if snapshotter != self.snapshotter {
            tracing::warn!(
                unpacked_into = %self.snapshotter,
                requested = snapshotter,
                "Snapshotter differs from the unpack target; parents may be missing"
            );
        }
        Arc::new(ContainerdSnapshots {
            client: Arc::clone(&self.client),
            namespace: self.namespace.clone(),
            snapshotter: snapshotter.to_string(),
        })
    }

    async fn close(&self) -> FlarewrapResult<()> {
        // The channel closes once the last clone of the client drops.
        tracing::debug!(namespace = %self.namespace, "Closing containerd session");
        Ok(())
    }
}

/// Unpack into `snapshotter` so chain ids exist where snapshots are taken.
fn unpack_config(platform: ProtoPlatform, snapshotter: &str) -> UnpackConfiguration {
    UnpackConfiguration {
        platform: Some(platform),
        snapshotter: snapshotter.to_string(),
    }
}

/// One snapshotter of a containerd session.
pub struct ContainerdSnapshots {
    client: Arc<Client>,
    namespace: String,
    snapshotter: String,
}

#[async_trait]
impl SnapshotService for ContainerdSnapshots {
    async fn prepare(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>> {
        let req = PrepareSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
            parent: parent.to_string(),
            ..Default::default()
        };
        let resp = self
            .client
            .snapshots()
            .prepare(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| snapshot_error(key, &s))?;
        Ok(resp.into_inner().mounts.into_iter().map(to_spec).collect())
    }

    async fn view(&self, key: &str, parent: &str) -> FlarewrapResult<Vec<MountSpec>> {
        let req = ViewSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
            parent: parent.to_string(),
            ..Default::default()
        };
        let resp = self
            .client
            .snapshots()
            .view(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| snapshot_error(key, &s))?;
        Ok(resp.into_inner().mounts.into_iter().map(to_spec).collect())
    }

    async fn mounts(&self, key: &str) -> FlarewrapResult<Vec<MountSpec>> {
        let req = MountsRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        let resp = self
            .client
            .snapshots()
            .mounts(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| snapshot_error(key, &s))?;
        Ok(resp.into_inner().mounts.into_iter().map(to_spec).collect())
    }

    async fn remove(&self, key: &str) -> FlarewrapResult<()> {
        let req = RemoveSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        self.client
            .snapshots()
            .remove(with_namespace!(req, self.namespace.as_str()))
            .await
            .map_err(|s| snapshot_error(key, &s))?;
        Ok(())
    }
}

fn to_spec(mount: Mount) -> MountSpec {
    MountSpec::new(mount.r#type, mount.source, mount.options)
}

fn snapshot_error(key: &str, status: &Status) -> FlarewrapError {
    let kind = match status.code() {
        Code::AlreadyExists => SnapshotErrorKind::KeyInUse,
        Code::NotFound => SnapshotErrorKind::NotFound,
        _ => SnapshotErrorKind::Backend,
    };
    FlarewrapError::snapshot(key, kind, status.message())
}

fn pull_error(reference: &str, status: &Status) -> FlarewrapError {
    FlarewrapError::Pull {
        reference: reference.to_string(),
        message: format!("{}: {}", status.code(), status.message()),
    }
}
