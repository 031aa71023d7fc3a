//! OCI image-spec data types.
//!
//! Serde representations of the image config, manifest, and index
//! documents, with field names matching the published OCI image spec.
//! Layer descriptor order and diff-ID order are load-bearing for
//! filesystem-overlay semantics and are never re-sorted anywhere in
//! this crate.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::constants::OCI_SCHEMA_VERSION;
use crate::platform::Platform;
use crate::storage::Digest;

/// A content descriptor: a typed, sized reference to a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced blob.
    pub media_type: String,
    /// Blob digest.
    pub digest: Digest,
    /// Blob size in bytes.
    pub size: u64,
    /// Target platform (index entries only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformSpec>,
}

/// Platform block inside a descriptor or image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformSpec {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl From<&Platform> for PlatformSpec {
    fn from(p: &Platform) -> Self {
        Self {
            architecture: p.arch.as_str().to_string(),
            os: p.os.as_str().to_string(),
            variant: p.variant.clone(),
        }
    }
}

impl PlatformSpec {
    /// Returns true if this spec names the given target platform.
    ///
    /// A spec with no variant matches any requested variant; a spec
    /// with a variant only matches the same variant.
    pub fn matches(&self, target: &Platform) -> bool {
        if self.os != target.os.as_str() || self.architecture != target.arch.as_str() {
            return false;
        }
        match (&self.variant, &target.variant) {
            (Some(a), Some(b)) => a == b,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

impl std::fmt::Display for PlatformSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{}", v)?;
        }
        Ok(())
    }
}

/// Per-platform image manifest: config blob plus ordered layer blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type of this document.
    pub media_type: String,
    /// Config blob descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base layers first. Order equals apply order.
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    /// Creates a manifest with the standard schema version and media type.
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: crate::constants::OCI_IMAGE_MANIFEST_MEDIA_TYPE.to_string(),
            config,
            layers,
        }
    }
}

/// Multi-platform image index: one manifest descriptor per platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (always 2).
    pub schema_version: u32,
    /// Media type of this document.
    pub media_type: String,
    /// Manifest descriptors, each carrying its platform.
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Creates an index with the standard schema version and media type.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: OCI_SCHEMA_VERSION,
            media_type: crate::constants::OCI_IMAGE_INDEX_MEDIA_TYPE.to_string(),
            manifests,
        }
    }
}

/// Per-platform image configuration blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    /// CPU architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Runtime configuration.
    #[serde(default)]
    pub config: RuntimeConfig,
    /// Filesystem history as ordered diff IDs.
    pub rootfs: RootFs,
}

/// Runtime configuration block of an image config.
///
/// Field names are the capitalized forms the image spec uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ordered environment variables in `KEY=value` form.
    #[serde(rename = "Env", default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Entrypoint command.
    #[serde(rename = "Entrypoint", default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command arguments.
    #[serde(rename = "Cmd", default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(rename = "WorkingDir", default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Exposed ports, e.g. `8080/tcp`. The value is always an empty
    /// object per the image spec; a sorted map keeps serialization
    /// deterministic.
    #[serde(
        rename = "ExposedPorts",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub exposed_ports: Option<BTreeMap<String, EmptyObject>>,
}

/// The empty JSON object used as the value type of `ExposedPorts`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Root filesystem block of an image config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Always `layers`.
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Diff IDs (uncompressed layer digests), base layers first.
    pub diff_ids: Vec<Digest>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}
