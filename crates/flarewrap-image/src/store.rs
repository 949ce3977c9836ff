//! Image store.
//!
//! Local, per-working-directory image namespace: metadata lives at
//! `images/<logical>.json`, the image's block file at `images/<logical>.img`.

use std::fs;
use std::path::PathBuf;

use flarewrap_common::{FlarewrapResult, Name, StorageLayout};

use crate::image::{Image, ImageMetadata};
use crate::reference::ImageReference;

/// How a machine's image string was understood.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// What to pull.
    pub reference: ImageReference,
    /// The logical name, when the string named a known image.
    pub logical_name: Option<Name>,
}

/// Local image store.
#[derive(Debug, Clone)]
pub struct ImageStore {
    layout: StorageLayout,
}

impl ImageStore {
    /// Create a store over a working directory layout.
    #[must_use]
    pub const fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    /// Path of an image's block file.
    #[must_use]
    pub fn image_path(&self, image: &Image) -> PathBuf {
        self.layout.image_file(image.logical_name().as_str())
    }

    /// Path of an image's metadata file.
    #[must_use]
    pub fn metadata_path(&self, image: &Image) -> PathBuf {
        self.layout.image_metadata(image.logical_name().as_str())
    }

    /// Whether the image's block file exists. No side effects.
    #[must_use]
    pub fn exists(&self, image: &Image) -> bool {
        self.image_path(image).exists()
    }

    /// Write metadata, replacing whatever was stored under the same
    /// logical name.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, metadata: &ImageMetadata) -> FlarewrapResult<()> {
        let path = self.layout.image_metadata(metadata.logical_name.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(&path, json)?;

        tracing::debug!(
            logical_name = %metadata.logical_name,
            path = %path.display(),
            "Saved image metadata"
        );
        Ok(())
    }

    /// Load metadata by logical name.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(&self, logical_name: &str) -> FlarewrapResult<Option<ImageMetadata>> {
        let path = self.layout.image_metadata(logical_name);
        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Resolve a machine's image string.
    ///
    /// A known logical name wins; anything else is parsed as a reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is neither.
    pub fn resolve(&self, image: &str) -> FlarewrapResult<ResolvedImage> {
        if Name::new(image).is_ok() {
            if let Some(meta) = self.load(image)? {
                return Ok(ResolvedImage {
                    reference: meta.reference,
                    logical_name: Some(meta.logical_name),
                });
            }
        }

        Ok(ResolvedImage {
            reference: ImageReference::parse(image)?,
            logical_name: None,
        })
    }

    /// List logical names with stored metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the images directory cannot be read.
    pub fn list(&self) -> FlarewrapResult<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.layout.images();
        if !dir.exists() {
            return Ok(names);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str().and_then(|n| n.strip_suffix(".json")) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
