//! Image model.

use chrono::{DateTime, Utc};
use flarewrap_common::{FlarewrapResult, Name};
use serde::{Deserialize, Serialize};

use crate::reference::ImageReference;

/// An image known to a working directory.
///
/// `reference` locates the content; `logical_name` is the local alias
/// used to derive on-disk paths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    reference: ImageReference,
    logical_name: Name,
}

impl Image {
    /// Create a new image.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference does not parse or the logical
    /// name is not filesystem-safe.
    pub fn new(reference: &str, logical_name: &str) -> FlarewrapResult<Self> {
        Ok(Self {
            reference: ImageReference::parse(reference)?,
            logical_name: Name::new(logical_name)?,
        })
    }

    /// The fully qualified content locator.
    #[must_use]
    pub const fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// The local alias.
    #[must_use]
    pub const fn logical_name(&self) -> &Name {
        &self.logical_name
    }
}

/// What a pull produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulledImage {
    /// The image that was pulled.
    pub reference: ImageReference,
    /// Digest of the image's target (manifest or index).
    pub digest: String,
    /// Chain id of the unpacked layers, usable as a snapshot parent.
    pub chain_id: String,
}

/// Persisted image metadata (`images/<logical>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Image reference.
    pub reference: ImageReference,
    /// Local alias.
    pub logical_name: Name,
    /// Manifest digest, once pulled.
    #[serde(default)]
    pub digest: Option<String>,
    /// Chain id of the unpacked layers, once pulled.
    #[serde(default)]
    pub chain_id: Option<String>,
    /// When the image was last pulled.
    #[serde(default)]
    pub pulled_at: Option<DateTime<Utc>>,
}

impl ImageMetadata {
    /// Metadata for an image that has not been pulled yet.
    #[must_use]
    pub fn unpulled(image: &Image) -> Self {
        Self {
            reference: image.reference().clone(),
            logical_name: image.logical_name().clone(),
            digest: None,
            chain_id: None,
            pulled_at: None,
        }
    }

    /// Record a pull result.
    #[must_use]
    pub fn with_pull(mut self, pulled: &PulledImage) -> Self {
        self.digest = Some(pulled.digest.clone());
        self.chain_id = Some(pulled.chain_id.clone());
        self.pulled_at = Some(Utc::now());
        self
    }
}
