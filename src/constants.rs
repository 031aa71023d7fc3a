//! # Containerization Constants
//!
//! Defines media types, layout markers, resource limits, and retry
//! parameters for the containerization engine. These constants are the
//! **single source of truth** for security-critical bounds throughout
//! the codebase.
//!
//! ## Security Rationale
//!
//! The size and count limits bound disk and memory usage when packaging
//! an untrusted project tree. Each limit documents the value, its units,
//! and what it bounds.
//!
//! ## Cross-References
//!
//! - [`crate::layer`]: Uses size and entry-count limits during packing
//! - [`crate::storage`]: Uses digest validation and blob path layout
//! - [`crate::export`]: Uses layout file names and push retry parameters

use std::time::Duration;

// =============================================================================
// OCI Media Types
// =============================================================================

/// Media type for an OCI image manifest.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Media type for an OCI image index (multi-platform entry point).
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// Media type for an OCI image config blob.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// Media type for a gzip-compressed tar layer.
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI image manifest/index schema version.
pub const OCI_SCHEMA_VERSION: u32 = 2;

// =============================================================================
// OCI Layout
// =============================================================================

/// Name of the layout marker file in an OCI layout directory.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// Contents of the layout marker file.
pub const OCI_LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\": \"1.0.0\"}";

/// Name of the index file in an OCI layout directory.
pub const OCI_INDEX_FILE: &str = "index.json";

/// Name of the blobs directory in an OCI layout directory (and in the
/// local blob store, which uses the same `blobs/<algorithm>/<hex>` shape).
pub const BLOBS_DIR: &str = "blobs";

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of a single compressed layer (512 MiB).
///
/// **Security**: Bounds disk usage when packaging a pathological project
/// tree. Checked after compression, before the blob is committed.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of filesystem entries packed into one layer.
///
/// **Security**: Bounds walk time and tar header overhead for trees with
/// pathological file counts. 100,000 entries is generous for a function
/// project while preventing inode-bomb inputs.
pub const MAX_ENTRIES_PER_LAYER: usize = 100_000;

// =============================================================================
// Push Parameters
// =============================================================================

/// Default number of concurrent blob uploads during a push.
///
/// Bounded to respect registry rate limits; callers can override via
/// [`Pusher::with_concurrency`](crate::export::Pusher::with_concurrency).
pub const DEFAULT_PUSH_CONCURRENCY: usize = 4;

/// Number of attempts for a network operation before surfacing the error.
///
/// Only transient failures (connection-level, HTTP 5xx) are retried;
/// validation and local I/O failures fail immediately.
pub const PUSH_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential push backoff (doubles per attempt).
pub const PUSH_RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
