//! # Build Orchestration
//!
//! Drives one containerization build end to end: walk and validate the
//! project tree, build the source layer, assemble one config/manifest
//! pair per requested platform, and commit the multi-platform index.
//!
//! Per-platform assembly runs on independent tokio tasks sharing the
//! blob store; the store's atomic-rename puts make concurrent commits
//! of identical blobs safe. A requested platform with no matching base
//! variant fails the whole build: a multi-platform image with a missing
//! variant is invalid, never silently thinner.
//!
//! Cancellation is observed at blob boundaries. A cancelled build
//! reports [`Error::Cancelled`] and leaves at most orphaned blobs in
//! the local store; no index is committed.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::image::{assemble, AssembledImage, BaseImage, RuntimeOverrides};
use crate::layer::{Layer, LayerBuilder};
use crate::manifest::{Descriptor, ImageIndex, PlatformSpec};
use crate::platform::Platform;
use crate::storage::{BlobStore, Digest};
use crate::walk::collect_entries;

/// Resolves a base image reference to its per-platform manifest and
/// config, with all referenced blobs placed in the build's store.
///
/// Supplied by the caller; the engine never fetches base images itself.
/// A resolver must return [`Error::MissingPlatform`] when the reference
/// has no variant for the requested platform.
#[async_trait]
pub trait BaseResolver: Send + Sync {
    /// Resolves `reference` for `platform`.
    async fn resolve(&self, reference: &str, platform: &Platform) -> Result<BaseImage>;
}

/// A resolver that answers every platform with an empty scratch base.
pub struct ScratchResolver;

#[async_trait]
impl BaseResolver for ScratchResolver {
    async fn resolve(&self, _reference: &str, _platform: &Platform) -> Result<BaseImage> {
        Ok(BaseImage::scratch())
    }
}

/// A fixed platform-to-base mapping.
///
/// Useful in tests and for callers that pre-resolve their bases.
/// Matching follows index semantics via [`PlatformSpec::matches`]: a
/// registered platform without a variant answers any requested variant.
/// A platform no entry matches is a fatal missing-variant error.
#[derive(Default)]
pub struct StaticBaseResolver {
    bases: Vec<(Platform, BaseImage)>,
}

impl StaticBaseResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a base for a platform.
    pub fn insert(&mut self, platform: Platform, base: BaseImage) {
        self.bases.push((platform, base));
    }
}

#[async_trait]
impl BaseResolver for StaticBaseResolver {
    async fn resolve(&self, reference: &str, platform: &Platform) -> Result<BaseImage> {
        self.bases
            .iter()
            .find(|(p, _)| PlatformSpec::from(p).matches(platform))
            .map(|(_, b)| b.clone())
            .ok_or_else(|| Error::MissingPlatform {
                reference: reference.to_string(),
                platform: platform.clone(),
                available: self
                    .bases
                    .iter()
                    .map(|(p, _)| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

/// Inputs to one build invocation.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Root of the function project's source tree.
    pub project_root: PathBuf,
    /// Ignore patterns supplied by the build orchestrator.
    pub ignore_patterns: Vec<String>,
    /// Target platforms. Empty means the host platform.
    pub platforms: Vec<Platform>,
    /// Base image reference, handed to the [`BaseResolver`] per platform.
    pub base_reference: String,
    /// Runtime metadata applied on top of the base config.
    pub overrides: RuntimeOverrides,
}

impl BuildRequest {
    /// Creates a request with defaults: host platform, no ignores, no
    /// overrides.
    pub fn new(project_root: impl Into<PathBuf>, base_reference: impl Into<String>) -> Self {
        Self {
            project_root: project_root.into(),
            ignore_patterns: Vec::new(),
            platforms: Vec::new(),
            base_reference: base_reference.into(),
            overrides: RuntimeOverrides::default(),
        }
    }
}

/// A finished multi-platform image, committed to the local store.
#[derive(Debug, Clone)]
pub struct BuiltImage {
    /// Digest of the stored index blob.
    pub index_digest: Digest,
    /// The index document.
    pub index: ImageIndex,
    /// Per-platform results, in request order.
    pub images: Vec<AssembledImage>,
    /// The source layer shared by every platform.
    pub layer: Layer,
}

/// The build orchestrator.
pub struct Builder {
    store: Arc<BlobStore>,
    resolver: Arc<dyn BaseResolver>,
}

impl Builder {
    /// Creates a builder over a store and a base resolver.
    pub fn new(store: Arc<BlobStore>, resolver: Arc<dyn BaseResolver>) -> Self {
        Self { store, resolver }
    }

    /// Runs a full build and returns the committed image.
    ///
    /// # Errors
    ///
    /// Any validation, storage, or assembly failure aborts the whole
    /// build before an index is committed. Partial blobs already
    /// written remain as content-addressed orphans and are never
    /// referenced.
    pub async fn build(
        &self,
        request: &BuildRequest,
        cancel: &CancellationToken,
    ) -> Result<BuiltImage> {
        let platforms = if request.platforms.is_empty() {
            vec![Platform::host()]
        } else {
            request.platforms.clone()
        };

        let mut seen = HashSet::new();
        for platform in &platforms {
            if !seen.insert(platform.clone()) {
                return Err(Error::DuplicatePlatform(platform.clone()));
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("source walk".to_string()));
        }

        // Walk and pack once: the source layer is platform-independent
        // and deterministic, so every platform shares one blob.
        let layer = {
            let store = Arc::clone(&self.store);
            let root = request.project_root.clone();
            let ignores = request.ignore_patterns.clone();
            tokio::task::spawn_blocking(move || {
                let entries = collect_entries(&root, &ignores)?;
                LayerBuilder::new(&store).build(&root, &entries)
            })
            .await
            .map_err(|e| Error::TaskFailed(format!("layer packing: {}", e)))??
        };

        info!(
            "building {} for {} platform(s) on layer {}",
            request.base_reference,
            platforms.len(),
            layer.digest
        );

        let mut tasks = Vec::with_capacity(platforms.len());
        for platform in &platforms {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!("assembly for {}", platform)));
            }

            let store = Arc::clone(&self.store);
            let resolver = Arc::clone(&self.resolver);
            let reference = request.base_reference.clone();
            let platform = platform.clone();
            let layer = layer.clone();
            let overrides = request.overrides.clone();

            tasks.push(tokio::spawn(async move {
                let base = resolver.resolve(&reference, &platform).await?;
                debug!("resolved base {} for {}", reference, platform);
                assemble(&store, &platform, &base, &layer, &overrides)
            }));
        }

        let mut images = Vec::with_capacity(tasks.len());
        let results = futures::future::try_join_all(tasks)
            .await
            .map_err(|e| Error::TaskFailed(format!("platform assembly: {}", e)))?;
        for result in results {
            images.push(result?);
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled("index commit".to_string()));
        }

        // Index entries follow request order: exactly one manifest per
        // requested platform.
        let manifests = images
            .iter()
            .map(|image| Descriptor {
                media_type: image.manifest.media_type.clone(),
                digest: image.manifest_digest.clone(),
                size: image.manifest_size,
                platform: Some(PlatformSpec::from(&image.platform)),
            })
            .collect();

        let index = ImageIndex::new(manifests);
        let index_digest = self.store.put(&serde_json::to_vec(&index)?)?;

        info!("built image index {}", index_digest);
        Ok(BuiltImage {
            index_digest,
            index,
            images,
            layer,
        })
    }
}
