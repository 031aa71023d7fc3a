//! # Image Export
//!
//! Serializes a finished build either to a local OCI layout directory
//! or to a remote registry.
//!
//! ## Layout Export
//!
//! Writes the standard layout shape: an `oci-layout` marker stating the
//! layout version, an `index.json` enumerating manifests and platforms,
//! and every referenced blob under `blobs/<algorithm>/<hex>`. Blobs
//! are read back through the store, so corruption is detected during
//! export rather than at inspection time.
//!
//! ## Registry Push
//!
//! Push order is bottom-up: layer and config blobs first, then each
//! platform's manifest, then the index under the tag. A reader fetching
//! the tag at any point during an in-progress push never observes a
//! manifest pointing at a not-yet-uploaded blob, and a failed push
//! leaves the tag untouched. Blob uploads run concurrently bounded by
//! a semaphore; transient failures are retried with exponential
//! backoff; cancellation is observed at every blob boundary.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::build::BuiltImage;
use crate::constants::{
    DEFAULT_PUSH_CONCURRENCY, OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_INDEX_FILE, OCI_LAYOUT_CONTENT,
    OCI_LAYOUT_FILE, PUSH_RETRY_ATTEMPTS, PUSH_RETRY_BASE_DELAY,
};
use crate::error::{Error, Result};
use crate::registry::{with_retry, Reference, RegistryTransport};
use crate::storage::{BlobStore, Digest};

// =============================================================================
// OCI Layout Export
// =============================================================================

/// Writes `built` as an OCI layout directory at `dir`.
///
/// The directory is created if missing. Existing blobs with matching
/// digests are left in place; the marker and index files are
/// overwritten.
pub fn write_oci_layout(store: &BlobStore, built: &BuiltImage, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;

    for digest in referenced_blobs(built) {
        let content = store.get(&digest)?;
        let path = dir
            .join(crate::constants::BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.hex());
        if path.exists() {
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, content)?;
        debug!("exported blob {}", digest);
    }

    fs::write(dir.join(OCI_LAYOUT_FILE), OCI_LAYOUT_CONTENT)?;
    fs::write(dir.join(OCI_INDEX_FILE), store.get(&built.index_digest)?)?;

    info!("wrote OCI layout to {}", dir.display());
    Ok(())
}

/// Returns every blob digest the built image references: per platform,
/// the manifest, its config, and its layers.
fn referenced_blobs(built: &BuiltImage) -> Vec<Digest> {
    let mut seen = HashSet::new();
    let mut digests = Vec::new();
    let mut add = |digest: &Digest| {
        if seen.insert(digest.clone()) {
            digests.push(digest.clone());
        }
    };

    for image in &built.images {
        for layer in &image.manifest.layers {
            add(&layer.digest);
        }
        add(&image.manifest.config.digest);
        add(&image.manifest_digest);
    }
    digests
}

// =============================================================================
// Registry Push
// =============================================================================

/// Pushes built images through a pluggable [`RegistryTransport`].
pub struct Pusher {
    transport: Arc<dyn RegistryTransport>,
    concurrency: usize,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl Pusher {
    /// Creates a pusher with default concurrency and retry parameters.
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self {
        Self {
            transport,
            concurrency: DEFAULT_PUSH_CONCURRENCY,
            retry_attempts: PUSH_RETRY_ATTEMPTS,
            retry_base_delay: PUSH_RETRY_BASE_DELAY,
        }
    }

    /// Sets the concurrent blob upload bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the retry policy for transient failures.
    pub fn with_retry_policy(mut self, attempts: u32, base_delay: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    /// Pushes all blobs, manifests, and finally the index tag.
    ///
    /// Returns the index digest on success. On failure, already
    /// uploaded blobs remain in the registry (content-addressed, so
    /// harmless) but the tag is never updated without a fully uploaded
    /// manifest chain.
    pub async fn push(
        &self,
        store: &Arc<BlobStore>,
        built: &BuiltImage,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<Digest> {
        info!("pushing {} platform(s) to {}", built.images.len(), reference);

        // Stage 1: every layer and config blob, concurrently.
        let blobs: Vec<Digest> = {
            let mut seen = HashSet::new();
            built
                .images
                .iter()
                .flat_map(|image| {
                    image
                        .manifest
                        .layers
                        .iter()
                        .map(|l| l.digest.clone())
                        .chain(std::iter::once(image.manifest.config.digest.clone()))
                })
                .filter(|d| seen.insert(d.clone()))
                .collect()
        };

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(blobs.len());
        for digest in blobs {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("blob upload {}", digest)));
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::Cancelled("blob upload".to_string()))?;
            let transport = Arc::clone(&self.transport);
            let store = Arc::clone(store);
            let reference = reference.clone();
            let cancel = cancel.clone();
            let attempts = self.retry_attempts;
            let base_delay = self.retry_base_delay;

            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled(format!("blob upload {}", digest)));
                }
                upload_one_blob(&*transport, &store, &reference, &digest, attempts, base_delay)
                    .await
            }));
        }

        for task in tasks {
            task.await
                .map_err(|e| Error::PushFailed {
                    reference: reference.to_string(),
                    reason: format!("upload task panicked: {}", e),
                })??;
        }

        // Stage 2: per-platform manifests, by digest.
        for image in &built.images {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("manifest for {}", image.platform)));
            }

            let content = store.get(&image.manifest_digest)?;
            with_retry(
                || {
                    self.transport.put_manifest(
                        reference,
                        image.manifest_digest.as_str(),
                        &image.manifest.media_type,
                        &content,
                    )
                },
                self.retry_attempts,
                self.retry_base_delay,
            )
            .await
            .map_err(|e| Error::PushFailed {
                reference: reference.to_string(),
                reason: format!("manifest for {}: {}", image.platform, e),
            })?;
            debug!("pushed manifest {} for {}", image.manifest_digest, image.platform);
        }

        // Stage 3: the index, under the tag. This is the publication
        // point; nothing before it is visible via the tag.
        if cancel.is_cancelled() {
            return Err(Error::Cancelled("index upload".to_string()));
        }

        let index_content = store.get(&built.index_digest)?;
        with_retry(
            || {
                self.transport.put_manifest(
                    reference,
                    &reference.tag,
                    OCI_IMAGE_INDEX_MEDIA_TYPE,
                    &index_content,
                )
            },
            self.retry_attempts,
            self.retry_base_delay,
        )
        .await
        .map_err(|e| Error::PushFailed {
            reference: reference.to_string(),
            reason: format!("index: {}", e),
        })?;

        info!("pushed {} ({})", reference, built.index_digest);
        Ok(built.index_digest.clone())
    }
}

/// Uploads one blob, skipping it when the registry already has it.
async fn upload_one_blob(
    transport: &dyn RegistryTransport,
    store: &BlobStore,
    reference: &Reference,
    digest: &Digest,
    attempts: u32,
    base_delay: Duration,
) -> Result<()> {
    let exists = with_retry(
        || transport.blob_exists(reference, digest),
        attempts,
        base_delay,
    )
    .await
    .map_err(|e| Error::PushFailed {
        reference: reference.to_string(),
        reason: format!("blob {}: {}", digest, e),
    })?;

    if exists {
        debug!("blob {} already on registry", digest);
        return Ok(());
    }

    let content = store.get(digest)?;
    with_retry(
        || transport.upload_blob(reference, digest, &content),
        attempts,
        base_delay,
    )
    .await
    .map_err(|e| Error::PushFailed {
        reference: reference.to_string(),
        reason: format!("blob {}: {}", digest, e),
    })?;

    debug!("pushed blob {}", digest);
    Ok(())
}
