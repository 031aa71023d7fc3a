//! Tests for the content-addressed blob store.
//!
//! Validates digest binding, idempotent puts, read-back verification,
//! and safety under concurrent puts from multiple workers.

use std::fs;
use std::sync::Arc;

use ocibuild::{BlobStore, Digest, Error};
use tempfile::TempDir;

// =============================================================================
// Store Creation
// =============================================================================

#[test]
fn store_creation_makes_blob_dir() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("store");

    let store = BlobStore::with_path(path.clone()).unwrap();

    assert!(path.join("blobs").exists());
    assert_eq!(store.base_dir(), path);
}

#[test]
fn store_creation_handles_nested_paths() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deeply").join("nested").join("store");

    BlobStore::with_path(path.clone()).unwrap();
    assert!(path.join("blobs").exists());
}

// =============================================================================
// Digest Binding
// =============================================================================

#[test]
fn put_returns_content_digest() {
    let temp = TempDir::new().unwrap();
    let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

    let digest = store.put(b"hello world").unwrap();
    assert_eq!(digest, Digest::of(b"hello world"));
    assert_eq!(digest.algorithm(), "sha256");
    assert_eq!(digest.hex().len(), 64);
}

#[test]
fn get_missing_blob_is_not_found() {
    let temp = TempDir::new().unwrap();
    let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

    let absent = Digest::of(b"never stored");
    assert!(!store.has(&absent));
    assert!(matches!(
        store.get(&absent),
        Err(Error::BlobNotFound { .. })
    ));
}

#[test]
fn identical_content_stored_once() {
    let temp = TempDir::new().unwrap();
    let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

    let d1 = store.put(b"duplicate content").unwrap();
    let d2 = store.put(b"duplicate content").unwrap();

    assert_eq!(d1, d2);
    // Exactly one file under blobs/sha256.
    let count = fs::read_dir(temp.path().join("blobs").join("sha256"))
        .unwrap()
        .count();
    assert_eq!(count, 1);
}

#[test]
fn corruption_is_surfaced_not_repaired() {
    let temp = TempDir::new().unwrap();
    let store = BlobStore::with_path(temp.path().to_path_buf()).unwrap();

    let digest = store.put(b"trustworthy").unwrap();
    fs::write(store.blob_path(&digest), b"flipped bits").unwrap();

    match store.get(&digest) {
        Err(Error::DigestMismatch { digest: key, computed }) => {
            assert_eq!(key, digest.to_string());
            assert_eq!(computed, Digest::of(b"flipped bits").to_string());
        }
        other => panic!("expected DigestMismatch, got {:?}", other.map(|_| ())),
    }
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn concurrent_puts_of_same_content_are_safe() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(BlobStore::with_path(temp.path().to_path_buf()).unwrap());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.put(b"contended blob").unwrap())
        })
        .collect();

    let digests: Vec<Digest> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(digests.windows(2).all(|w| w[0] == w[1]));

    // A reader never observes a partial blob: the committed content is
    // exactly what was put.
    assert_eq!(store.get(&digests[0]).unwrap(), b"contended blob");
}

#[test]
fn concurrent_puts_of_distinct_content_all_land() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(BlobStore::with_path(temp.path().to_path_buf()).unwrap());

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let content = vec![i; 64];
                (store.put(&content).unwrap(), content)
            })
        })
        .collect();

    for handle in handles {
        let (digest, content) = handle.join().unwrap();
        assert_eq!(store.get(&digest).unwrap(), content);
    }
}
