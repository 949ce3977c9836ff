//! Integration tests for flarewrap-image.

use flarewrap_common::StorageLayout;
use flarewrap_image::{Image, ImageMetadata, ImageStore, PulledImage};
use tempfile::tempdir;

#[test]
fn test_image_store_lifecycle() {
    let temp = tempdir().unwrap();
    let layout = StorageLayout::new(temp.path());
    layout.ensure_structure().unwrap();
    let store = ImageStore::new(layout);

    // Initially empty
    assert!(store.list().unwrap().is_empty());

    let image = Image::new("alpine:latest", "alpine").unwrap();
    assert!(!store.exists(&image));

    let pulled = PulledImage {
        reference: image.reference().clone(),
        digest: "sha256:manifest".to_string(),
        chain_id: "sha256:chain".to_string(),
    };
    store
        .save(&ImageMetadata::unpulled(&image).with_pull(&pulled))
        .unwrap();

    let loaded = store.load("alpine").unwrap().unwrap();
    assert_eq!(loaded.digest.as_deref(), Some("sha256:manifest"));
    assert_eq!(store.list().unwrap(), vec!["alpine".to_string()]);

    // Metadata alone does not make the block file exist
    assert!(!store.exists(&image));
}

#[test]
fn test_resolve_unknown_name_parses_reference() {
    let temp = tempdir().unwrap();
    let store = ImageStore::new(StorageLayout::new(temp.path()));

    let resolved = store.resolve("busybox").unwrap();
    assert_eq!(
        resolved.reference.full_reference(),
        "docker.io/library/busybox:latest"
    );
    assert!(resolved.logical_name.is_none());

    assert!(store.resolve("Not A Reference").is_err());
}

#[test]
fn test_corrupt_metadata_is_an_error() {
    let temp = tempdir().unwrap();
    let layout = StorageLayout::new(temp.path());
    layout.ensure_structure().unwrap();
    std::fs::write(layout.image_metadata("broken"), b"{not json").unwrap();

    let store = ImageStore::new(layout);
    assert!(store.load("broken").is_err());
    assert!(store.resolve("broken").is_err());
}
