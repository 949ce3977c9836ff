//! OCI image manifest, index and config.
//!
//! Only the fields needed to find an image's unpacked layers are modelled.

use flarewrap_common::{FlarewrapError, FlarewrapResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// OCI image index media type.
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
/// Docker manifest list media type.
pub const MEDIA_TYPE_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size.
    #[serde(default)]
    pub size: i64,
    /// Platform, for index entries.
    #[serde(default)]
    pub platform: Option<Platform>,
}

/// Platform of an index entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    /// CPU architecture (`amd64`, `arm64`, ...).
    pub architecture: String,
    /// OS.
    pub os: String,
    /// Architecture variant (`v8`).
    #[serde(default)]
    pub variant: Option<String>,
}

impl Platform {
    /// The platform this process runs on, in OCI spelling.
    #[must_use]
    pub fn host() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self {
            architecture: architecture.to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    fn matches(&self, other: &Self) -> bool {
        self.os == other.os && self.architecture == other.architecture
    }
}

/// OCI image index (or Docker manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Per-platform manifests.
    pub manifests: Vec<Descriptor>,
}

/// OCI image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageManifest {
    /// Schema version.
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,
    /// Media type.
    #[serde(rename = "mediaType", default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors.
    pub layers: Vec<Descriptor>,
}

/// OCI image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// OS.
    #[serde(default)]
    pub os: String,
    /// Rootfs.
    #[serde(default)]
    pub rootfs: Rootfs,
}

/// Rootfs section of an image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rootfs {
    /// Type.
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Layer diff IDs.
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

/// A blob that is either an index or a manifest.
#[derive(Debug, Clone)]
pub enum ManifestOrIndex {
    /// A multi-platform index.
    Index(ImageIndex),
    /// A single-platform manifest.
    Manifest(ImageManifest),
}

impl ManifestOrIndex {
    /// Parse a manifest-like blob, deciding on `mediaType` or shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob is neither.
    pub fn parse(data: &[u8]) -> FlarewrapResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(data)?;
        let media_type = value.get("mediaType").and_then(|v| v.as_str()).unwrap_or("");

        if media_type == MEDIA_TYPE_INDEX
            || media_type == MEDIA_TYPE_MANIFEST_LIST
            || value.get("manifests").is_some()
        {
            Ok(Self::Index(serde_json::from_value(value)?))
        } else {
            Ok(Self::Manifest(serde_json::from_value(value)?))
        }
    }
}

/// Pick the manifest for `platform` out of an index.
///
/// # Errors
///
/// Returns [`FlarewrapError::Unsupported`] when no entry matches.
pub fn select_manifest<'a>(index: &'a ImageIndex, platform: &Platform) -> FlarewrapResult<&'a Descriptor> {
    index
        .manifests
        .iter()
        .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(platform)))
        .ok_or_else(|| FlarewrapError::Unsupported {
            feature: format!("image for platform {}/{}", platform.os, platform.architecture),
        })
}

/// Fold layer diff ids into the chain id of the top layer.
///
/// `chain(0) = diff(0)`, `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
/// This is the key unpacked layers are committed under in the snapshotter.
///
/// # Errors
///
/// Returns an error for an image without layers.
pub fn chain_id(diff_ids: &[String]) -> FlarewrapResult<String> {
    let (first, rest) = diff_ids.split_first().ok_or_else(|| FlarewrapError::Internal {
        message: "image has no layers".to_string(),
    })?;

    Ok(rest.iter().fold(first.clone(), |chain, diff| {
        let hash = Sha256::digest(format!("{chain} {diff}").as_bytes());
        format!("sha256:{}", hex::encode(hash))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_layer_chain_is_the_diff_id() {
        let ids = vec!["sha256:aaaa".to_string()];
        assert_eq!(chain_id(&ids).unwrap(), "sha256:aaaa");
        assert!(chain_id(&[]).is_err());
    }

    #[test]
    fn chain_folds_left() {
        let ids = vec!["sha256:a".to_string(), "sha256:b".to_string()];
        let expected = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(b"sha256:a sha256:b"))
        );
        assert_eq!(chain_id(&ids).unwrap(), expected);

        let three = vec![ids[0].clone(), ids[1].clone(), "sha256:c".to_string()];
        let expected3 = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(format!("{expected} sha256:c").as_bytes()))
        );
        assert_eq!(chain_id(&three).unwrap(), expected3);
    }

    #[test]
    fn index_is_detected_and_filtered() {
        let index = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"mediaType": "m", "digest": "sha256:arm", "size": 1,
                 "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}},
                {"mediaType": "m", "digest": "sha256:amd", "size": 1,
                 "platform": {"architecture": "amd64", "os": "linux"}}
            ]
        }"#;

        let ManifestOrIndex::Index(index) = ManifestOrIndex::parse(index).unwrap() else {
            panic!("expected an index");
        };
        let amd64 = Platform {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            variant: None,
        };
        assert_eq!(select_manifest(&index, &amd64).unwrap().digest, "sha256:amd");

        let riscv = Platform {
            architecture: "riscv64".to_string(),
            ..amd64
        };
        assert!(select_manifest(&index, &riscv).is_err());
    }

    #[test]
    fn manifest_is_detected() {
        let manifest = br#"{
            "schemaVersion": 2,
            "config": {"mediaType": "c", "digest": "sha256:cfg", "size": 10},
            "layers": [{"mediaType": "l", "digest": "sha256:l1", "size": 20}]
        }"#;
        assert!(matches!(
            ManifestOrIndex::parse(manifest).unwrap(),
            ManifestOrIndex::Manifest(m) if m.config.digest == "sha256:cfg"
        ));
    }
}
