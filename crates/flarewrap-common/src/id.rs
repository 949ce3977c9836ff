//! Names, run identifiers, snapshot keys and digests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FlarewrapError, FlarewrapResult};

/// A validated, filesystem-safe name.
///
/// Used for machine names and image logical names, both of which end up
/// as path components under the working directory. Names must:
/// - Be 1-64 characters long
/// - Contain only alphanumeric characters, dots, hyphens and underscores
/// - Start with an alphanumeric character
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    /// Maximum length of a name.
    pub const MAX_LENGTH: usize = 64;

    /// Create a new name, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the name format is invalid.
    pub fn new(name: impl Into<String>) -> FlarewrapResult<Self> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Get the name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> FlarewrapResult<()> {
        let invalid = || FlarewrapError::InvalidName {
            name: name.to_string(),
        };

        if name.is_empty() || name.len() > Self::MAX_LENGTH {
            return Err(invalid());
        }

        if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(invalid());
        }

        Ok(())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Name {
    type Err = FlarewrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Name {
    type Error = FlarewrapError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one pipeline invocation.
///
/// Scratch directories and snapshot keys embed it so concurrent runs
/// never share on-disk or content-store state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a new random run ID.
    ///
    /// The ID is a 12-character hex string derived from a UUID v4.
    #[must_use]
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4();
        Self(hex::encode(&uuid.as_bytes()[..6]))
    }

    /// Get the run ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Replace everything that is not safe in a single path component.
///
/// `docker.io/library/alpine:latest` becomes `docker.io_library_alpine_latest`.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// A snapshot key in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotKey(String);

impl SnapshotKey {
    /// Prefix shared by every key this toolkit creates.
    pub const PREFIX: &'static str = "flarewrap";

    /// Derive the key for one run of `machine` over `image`.
    #[must_use]
    pub fn derive(machine: &Name, image: &str, run: &RunId) -> Self {
        Self(format!(
            "{}-{}-{}-{}",
            Self::PREFIX,
            machine,
            sanitize_component(image),
            run
        ))
    }

    /// Wrap an existing key (e.g. one read back from a machine record).
    #[must_use]
    pub fn from_existing(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Get the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for SnapshotKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = FlarewrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash)) if !algorithm.is_empty() && !hash.is_empty() => {
                Ok(Self::new(algorithm, hash))
            }
            _ => Err(FlarewrapError::InvalidImageReference {
                reference: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn valid_names() {
        assert!(Name::new("default").is_ok());
        assert!(Name::new("my-vm").is_ok());
        assert!(Name::new("alpine_3.19").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(Name::new("").is_err());
        assert!(Name::new("-invalid").is_err());
        assert!(Name::new(".hidden").is_err());
        assert!(Name::new("a/b").is_err());
        assert!(Name::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generate_run_id() {
        let id1 = RunId::generate();
        let id2 = RunId::generate();
        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 12);
    }

    #[test]
    fn snapshot_key_embeds_run() {
        let name = Name::new("default").unwrap();
        let run = RunId::generate();
        let key = SnapshotKey::derive(&name, "alpine:latest", &run);
        assert_eq!(
            key.as_str(),
            format!("flarewrap-default-alpine_latest-{run}")
        );
    }

    #[test]
    fn digest_parsing() {
        let digest: Digest = "sha256:abc123def456".parse().unwrap();
        assert_eq!(digest.algorithm, "sha256");
        assert_eq!(digest.hash, "abc123def456");
        assert_eq!(digest.to_string(), "sha256:abc123def456");
        assert!("nocolon".parse::<Digest>().is_err());
    }

    proptest! {
        #[test]
        fn same_pair_different_runs_never_collide(
            name in "[a-z][a-z0-9-]{0,20}",
            image in "[a-z/:.0-9]{1,30}",
        ) {
            let name = Name::new(name).unwrap();
            let a = SnapshotKey::derive(&name, &image, &RunId::generate());
            let b = SnapshotKey::derive(&name, &image, &RunId::generate());
            prop_assert_ne!(a, b);
        }

        #[test]
        fn sanitized_component_has_no_separator(raw in ".{0,40}") {
            let clean = sanitize_component(&raw);
            prop_assert!(!clean.contains('/'));
            prop_assert!(!clean.contains('\0'));
        }
    }
}
