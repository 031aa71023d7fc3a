//! Exporter tests: OCI layout directories and registry pushing.
//!
//! The push tests run against a mock transport that records call order
//! and injects failures, verifying the bottom-up publication ordering:
//! blobs before manifests, manifests before the tag.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ocibuild::{
    write_oci_layout, BlobStore, BuildRequest, Builder, BuiltImage, Digest, Error, ImageIndex,
    Platform, Pusher, Reference, RegistryTransport, ScratchResolver, TransportError,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Fixtures
// =============================================================================

async fn built_image(store: &Arc<BlobStore>, platforms: &[&str]) -> BuiltImage {
    let project = TempDir::new().unwrap();
    fs::write(project.path().join("handler.py"), b"def main(): pass\n").unwrap();

    let builder = Builder::new(Arc::clone(store), Arc::new(ScratchResolver));
    let mut request = BuildRequest::new(project.path(), "scratch");
    request.platforms = platforms
        .iter()
        .map(|p| Platform::parse(p).unwrap())
        .collect();

    builder
        .build(&request, &CancellationToken::new())
        .await
        .unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn new_store() -> Arc<BlobStore> {
    init_tracing();
    Arc::new(BlobStore::with_path(TempDir::new().unwrap().keep()).unwrap())
}

/// Records every transport call; can fail one manifest digest fatally
/// and fail the first N blob uploads transiently.
#[derive(Default)]
struct MockTransport {
    log: Mutex<Vec<String>>,
    fail_manifest: Mutex<Option<String>>,
    transient_blob_failures: AtomicU32,
}

impl MockTransport {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn fail_manifest_digest(&self, digest: &Digest) {
        *self.fail_manifest.lock().unwrap() = Some(digest.to_string());
    }
}

#[async_trait]
impl RegistryTransport for MockTransport {
    async fn blob_exists(
        &self,
        _reference: &Reference,
        digest: &Digest,
    ) -> Result<bool, TransportError> {
        self.log.lock().unwrap().push(format!("exists {}", digest));
        Ok(false)
    }

    async fn upload_blob(
        &self,
        _reference: &Reference,
        digest: &Digest,
        _content: &[u8],
    ) -> Result<(), TransportError> {
        if self
            .transient_blob_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Transient("connection reset".to_string()));
        }
        self.log.lock().unwrap().push(format!("blob {}", digest));
        Ok(())
    }

    async fn put_manifest(
        &self,
        _reference: &Reference,
        target: &str,
        _media_type: &str,
        _content: &[u8],
    ) -> Result<(), TransportError> {
        if self.fail_manifest.lock().unwrap().as_deref() == Some(target) {
            return Err(TransportError::Fatal("rejected by registry".to_string()));
        }
        self.log.lock().unwrap().push(format!("manifest {}", target));
        Ok(())
    }
}

// =============================================================================
// OCI Layout
// =============================================================================

#[tokio::test]
async fn layout_has_marker_index_and_blobs() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64", "linux/arm64"]).await;

    let out = TempDir::new().unwrap();
    write_oci_layout(&store, &built, out.path()).unwrap();

    let marker = fs::read_to_string(out.path().join("oci-layout")).unwrap();
    assert!(marker.contains("\"imageLayoutVersion\": \"1.0.0\""));

    let index: ImageIndex =
        serde_json::from_slice(&fs::read(out.path().join("index.json")).unwrap()).unwrap();
    assert_eq!(index.manifests.len(), 2);

    // Every referenced blob is present under blobs/<algorithm>/<hex>.
    for image in &built.images {
        let mut digests = vec![image.manifest_digest.clone(), image.manifest.config.digest.clone()];
        digests.extend(image.manifest.layers.iter().map(|l| l.digest.clone()));
        for digest in digests {
            let path = out
                .path()
                .join("blobs")
                .join(digest.algorithm())
                .join(digest.hex());
            assert!(path.exists(), "missing blob {}", digest);
        }
    }
}

#[tokio::test]
async fn layout_export_is_rerunnable() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64"]).await;

    let out = TempDir::new().unwrap();
    write_oci_layout(&store, &built, out.path()).unwrap();
    write_oci_layout(&store, &built, out.path()).unwrap();

    assert!(out.path().join("index.json").exists());
}

// =============================================================================
// Registry Push: Ordering
// =============================================================================

#[tokio::test]
async fn push_orders_blobs_then_manifests_then_tag() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64", "linux/arm64"]).await;
    let transport = Arc::new(MockTransport::default());
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let pusher = Pusher::new(Arc::<MockTransport>::clone(&transport));
    let digest = pusher
        .push(&store, &built, &reference, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(digest, built.index_digest);

    let log = transport.log();
    let first_manifest = log.iter().position(|l| l.starts_with("manifest")).unwrap();
    let last_blob = log
        .iter()
        .rposition(|l| l.starts_with("blob"))
        .unwrap();
    assert!(
        last_blob < first_manifest,
        "all blobs must precede manifests: {:?}",
        log
    );

    // The tag upload is last, after both platform manifests (pushed by
    // digest).
    assert_eq!(log.last().unwrap(), "manifest v1");
    let manifest_count = log.iter().filter(|l| l.starts_with("manifest")).count();
    assert_eq!(manifest_count, 3, "two digests plus the tag: {:?}", log);
}

#[tokio::test]
async fn push_deduplicates_shared_blobs() {
    let store = new_store();
    // Both platforms share the scratch base and the same source layer.
    let built = built_image(&store, &["linux/amd64", "linux/arm64"]).await;
    let transport = Arc::new(MockTransport::default());
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    Pusher::new(Arc::<MockTransport>::clone(&transport))
        .push(&store, &built, &reference, &CancellationToken::new())
        .await
        .unwrap();

    let log = transport.log();
    let blobs: Vec<_> = log.iter().filter(|l| l.starts_with("blob")).collect();
    let unique: HashSet<_> = blobs.iter().collect();
    assert_eq!(blobs.len(), unique.len(), "each blob uploaded once: {:?}", log);
}

// =============================================================================
// Registry Push: Failure Semantics
// =============================================================================

#[tokio::test]
async fn failed_second_manifest_never_updates_the_tag() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64", "linux/arm64"]).await;
    let transport = Arc::new(MockTransport::default());
    transport.fail_manifest_digest(&built.images[1].manifest_digest);
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let result = Pusher::new(Arc::<MockTransport>::clone(&transport))
        .push(&store, &built, &reference, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(Error::PushFailed { .. })));

    let log = transport.log();
    // Blobs already uploaded stay uploaded; the tag was never touched.
    assert!(log.iter().any(|l| l.starts_with("blob")));
    assert!(
        !log.iter().any(|l| l == "manifest v1"),
        "tag must not be updated: {:?}",
        log
    );
}

#[tokio::test]
async fn transient_blob_failures_are_retried() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64"]).await;
    let transport = Arc::new(MockTransport::default());
    transport.transient_blob_failures.store(2, Ordering::SeqCst);
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let pusher = Pusher::new(Arc::<MockTransport>::clone(&transport))
        .with_retry_policy(3, Duration::from_millis(1));
    pusher
        .push(&store, &built, &reference, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(transport.log().last().unwrap(), "manifest v1");
}

#[tokio::test]
async fn exhausted_retries_surface_as_push_failure() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64"]).await;
    let transport = Arc::new(MockTransport::default());
    transport.transient_blob_failures.store(100, Ordering::SeqCst);
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let pusher = Pusher::new(Arc::<MockTransport>::clone(&transport))
        .with_retry_policy(2, Duration::from_millis(1));
    let result = pusher
        .push(&store, &built, &reference, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(Error::PushFailed { .. })));
    assert!(!transport.log().iter().any(|l| l.starts_with("manifest")));
}

#[tokio::test]
async fn cancelled_push_starts_no_uploads() {
    let store = new_store();
    let built = built_image(&store, &["linux/amd64"]).await;
    let transport = Arc::new(MockTransport::default());
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Pusher::new(Arc::<MockTransport>::clone(&transport))
        .push(&store, &built, &reference, &cancel)
        .await;

    assert!(matches!(result, Err(Error::Cancelled(_))));
    assert!(transport.log().is_empty());
}

#[tokio::test]
async fn cancellation_mid_push_finishes_in_flight_upload_only() {
    /// Flips the shared token from inside the first upload, then
    /// completes that upload normally.
    struct CancellingTransport {
        cancel: CancellationToken,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RegistryTransport for CancellingTransport {
        async fn blob_exists(
            &self,
            _reference: &Reference,
            _digest: &Digest,
        ) -> Result<bool, TransportError> {
            Ok(false)
        }

        async fn upload_blob(
            &self,
            _reference: &Reference,
            digest: &Digest,
            _content: &[u8],
        ) -> Result<(), TransportError> {
            self.cancel.cancel();
            self.log.lock().unwrap().push(format!("blob {}", digest));
            Ok(())
        }

        async fn put_manifest(
            &self,
            _reference: &Reference,
            target: &str,
            _media_type: &str,
            _content: &[u8],
        ) -> Result<(), TransportError> {
            self.log.lock().unwrap().push(format!("manifest {}", target));
            Ok(())
        }
    }

    let store = new_store();
    // A scratch single-platform build has two blobs (layer + config),
    // so one upload is always left to start after the cancellation.
    let built = built_image(&store, &["linux/amd64"]).await;
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    let cancel = CancellationToken::new();
    let transport = Arc::new(CancellingTransport {
        cancel: cancel.clone(),
        log: Mutex::new(Vec::new()),
    });

    let result = Pusher::new(Arc::<CancellingTransport>::clone(&transport))
        .with_concurrency(1)
        .push(&store, &built, &reference, &cancel)
        .await;

    assert!(matches!(result, Err(Error::Cancelled(_))));

    // The upload in flight at cancellation time finished; nothing new
    // started, and the manifest and tag stages were never reached.
    let log = transport.log.lock().unwrap().clone();
    assert_eq!(log.iter().filter(|l| l.starts_with("blob")).count(), 1);
    assert!(
        !log.iter().any(|l| l.starts_with("manifest")),
        "no manifest or tag upload after cancellation: {:?}",
        log
    );
}

// =============================================================================
// Concurrency Bound
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_respect_the_bound() {
    use std::sync::atomic::AtomicI32;

    /// Tracks the high-water mark of concurrent uploads.
    #[derive(Default)]
    struct CountingTransport {
        current: AtomicI32,
        peak: AtomicI32,
    }

    #[async_trait]
    impl RegistryTransport for CountingTransport {
        async fn blob_exists(
            &self,
            _reference: &Reference,
            _digest: &Digest,
        ) -> Result<bool, TransportError> {
            Ok(false)
        }

        async fn upload_blob(
            &self,
            _reference: &Reference,
            _digest: &Digest,
            _content: &[u8],
        ) -> Result<(), TransportError> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn put_manifest(
            &self,
            _reference: &Reference,
            _target: &str,
            _media_type: &str,
            _content: &[u8],
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    let store = new_store();
    let built = built_image(&store, &["linux/amd64", "linux/arm64", "linux/arm/v7"]).await;
    let transport = Arc::new(CountingTransport::default());
    let reference = Reference::parse("registry.example.com/fn/greeter:v1").unwrap();

    Pusher::new(Arc::<CountingTransport>::clone(&transport))
        .with_concurrency(2)
        .push(&store, &built, &reference, &CancellationToken::new())
        .await
        .unwrap();

    assert!(
        transport.peak.load(Ordering::SeqCst) <= 2,
        "upload concurrency exceeded the bound"
    );
}
