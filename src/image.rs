//! # Per-Platform Image Assembly
//!
//! Produces one image config and manifest for a target platform from
//! three inputs: the resolved base image (manifest + config, with its
//! blobs already in the store), the newly built source layer, and the
//! caller's runtime overrides.
//!
//! The assembly algorithm is strictly additive with respect to the
//! base: inherited environment, entrypoint, and other runtime fields
//! are copied first, overrides are applied on top, and the new layer's
//! diff ID and blob descriptor are appended **last** to the inherited
//! lists. Base-layer order is preserved untouched; that order is what
//! gives the filesystem overlay its semantics.

use tracing::debug;

use crate::constants::OCI_IMAGE_CONFIG_MEDIA_TYPE;
use crate::error::Result;
use crate::layer::Layer;
use crate::manifest::{Descriptor, EmptyObject, ImageConfig, ImageManifest};
use crate::platform::Platform;
use crate::storage::{BlobStore, Digest};

/// A base image resolved for one platform.
///
/// Produced by a [`BaseResolver`](crate::build::BaseResolver); all
/// blobs the manifest references must already be present in the store.
#[derive(Debug, Clone)]
pub struct BaseImage {
    /// The base's per-platform manifest.
    pub manifest: ImageManifest,
    /// The base's per-platform config.
    pub config: ImageConfig,
}

impl BaseImage {
    /// An empty (scratch) base with no layers and default runtime
    /// configuration.
    pub fn scratch() -> Self {
        Self {
            manifest: ImageManifest::new(
                Descriptor {
                    media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
                    digest: Digest::of(b"{}"),
                    size: 2,
                    platform: None,
                },
                Vec::new(),
            ),
            config: ImageConfig::default(),
        }
    }
}

/// Caller-supplied runtime metadata applied on top of the base config.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    /// Environment variables; replace same-named inherited variables in
    /// place, otherwise append in the given order.
    pub env: Vec<(String, String)>,
    /// Replacement entrypoint, if any.
    pub entrypoint: Option<Vec<String>>,
    /// Replacement command, if any.
    pub cmd: Option<Vec<String>>,
    /// Replacement working directory, if any.
    pub working_dir: Option<String>,
    /// Additional exposed ports in `port/proto` form.
    pub exposed_ports: Vec<String>,
}

/// A finished per-platform image: stored config and manifest.
#[derive(Debug, Clone)]
pub struct AssembledImage {
    /// Platform this image targets.
    pub platform: Platform,
    /// Digest of the stored manifest blob.
    pub manifest_digest: Digest,
    /// The manifest itself (for export and index construction).
    pub manifest: ImageManifest,
    /// Serialized manifest size in bytes.
    pub manifest_size: u64,
}

/// Assembles and stores the config and manifest for one platform.
pub fn assemble(
    store: &BlobStore,
    platform: &Platform,
    base: &BaseImage,
    layer: &Layer,
    overrides: &RuntimeOverrides,
) -> Result<AssembledImage> {
    let mut config = base.config.clone();
    config.architecture = platform.arch.as_str().to_string();
    config.os = platform.os.as_str().to_string();
    config.variant = platform.variant.clone();

    apply_overrides(&mut config, overrides);
    config.rootfs.diff_ids.push(layer.diff_id.clone());

    let config_bytes = serde_json::to_vec(&config)?;
    let config_digest = store.put(&config_bytes)?;
    debug!("stored config {} for {}", config_digest, platform);

    let mut layers = base.manifest.layers.clone();
    layers.push(layer.descriptor());

    let manifest = ImageManifest::new(
        Descriptor {
            media_type: OCI_IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            digest: config_digest,
            size: config_bytes.len() as u64,
            platform: None,
        },
        layers,
    );

    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = store.put(&manifest_bytes)?;
    debug!("stored manifest {} for {}", manifest_digest, platform);

    Ok(AssembledImage {
        platform: platform.clone(),
        manifest_digest,
        manifest,
        manifest_size: manifest_bytes.len() as u64,
    })
}

/// Applies runtime overrides on top of the inherited config.
fn apply_overrides(config: &mut ImageConfig, overrides: &RuntimeOverrides) {
    for (key, value) in &overrides.env {
        let formatted = format!("{}={}", key, value);
        let prefix = format!("{}=", key);
        match config.config.env.iter_mut().find(|e| e.starts_with(&prefix)) {
            Some(existing) => *existing = formatted,
            None => config.config.env.push(formatted),
        }
    }

    if let Some(entrypoint) = &overrides.entrypoint {
        config.config.entrypoint = Some(entrypoint.clone());
    }
    if let Some(cmd) = &overrides.cmd {
        config.config.cmd = Some(cmd.clone());
    }
    if let Some(working_dir) = &overrides.working_dir {
        config.config.working_dir = Some(working_dir.clone());
    }

    if !overrides.exposed_ports.is_empty() {
        let ports = config.config.exposed_ports.get_or_insert_with(Default::default);
        for port in &overrides.exposed_ports {
            ports.insert(port.clone(), EmptyObject {});
        }
    }
}
