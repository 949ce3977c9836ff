//! Image reference parsing.

use std::fmt;
use std::str::FromStr;

use flarewrap_common::{FlarewrapError, FlarewrapResult};
use serde::{Deserialize, Serialize};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageReference {
    /// Registry hostname.
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `localhost:5000/app` -> localhost:5000/app:latest
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    ///
    /// # Errors
    ///
    /// Returns [`FlarewrapError::InvalidImageReference`] for empty names,
    /// empty tags or characters a registry would reject.
    pub fn parse(reference: &str) -> FlarewrapResult<Self> {
        let raw = reference;
        let reference = reference.trim();
        let invalid = || FlarewrapError::InvalidImageReference {
            reference: raw.to_string(),
        };

        let (name, tag) = if let Some((name, digest)) = reference.split_once('@') {
            if !digest.contains(':') {
                return Err(invalid());
            }
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon before the last slash belongs to a registry port
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        if name.is_empty() || name.starts_with('/') || name.ends_with('/') {
            return Err(invalid());
        }
        if let ImageTag::Tag(t) = &tag {
            if t.is_empty() || !t.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
                return Err(invalid());
            }
        }

        let (registry, repository) = match name.split_once('/') {
            // Registries have dots, a port, or are localhost
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (Self::DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        if repository.is_empty()
            || !repository
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(invalid());
        }

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }
}

impl FromStr for ImageReference {
    type Err = FlarewrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageReference {
    type Error = FlarewrapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageReference> for String {
    fn from(reference: ImageReference) -> Self {
        reference.full_reference()
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
