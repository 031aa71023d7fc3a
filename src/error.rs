//! Error types for the containerization engine.

use std::path::PathBuf;

use crate::platform::Platform;

/// Result type alias for containerization operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or exporting an image.
///
/// Every variant carries enough context (path, digest, platform, or
/// reference) to diagnose the failure without re-running the build.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation Errors (fatal, never retried)
    // =========================================================================
    /// Symlink target is an absolute path.
    #[error("symlink '{path}' has absolute target '{target}': absolute link targets are not allowed")]
    AbsoluteSymlink { path: PathBuf, target: String },

    /// Symlink resolves outside the project root.
    #[error("symlink '{path}' resolves to '{resolved}', outside the project root")]
    SymlinkEscape { path: PathBuf, resolved: PathBuf },

    /// Filesystem entry could not be read during the walk.
    #[error("failed to read '{path}': {reason}")]
    UnreadableEntry { path: PathBuf, reason: String },

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Storage initialization failed.
    #[error("failed to initialize blob store at {path}: {reason}")]
    StorageInitFailed { path: PathBuf, reason: String },

    /// Blob not found in storage.
    #[error("blob not found: {digest}")]
    BlobNotFound { digest: String },

    /// Storage write failed.
    #[error("failed to write to blob store: {0}")]
    StorageWriteFailed(String),

    /// Stored content no longer matches its digest key.
    #[error("blob {digest} is corrupt: content hashes to {computed}")]
    DigestMismatch { digest: String, computed: String },

    // =========================================================================
    // Layer / Assembly Errors
    // =========================================================================
    /// Layer construction failed.
    #[error("failed to build layer: {0}")]
    LayerBuildFailed(String),

    /// A background build task stopped without producing a result.
    #[error("build task failed during {0}")]
    TaskFailed(String),

    /// Layer exceeds the configured size bound.
    #[error("layer exceeds size limit: {size} > {limit} bytes")]
    LayerTooLarge { size: u64, limit: u64 },

    /// Project tree exceeds the per-layer file count bound.
    #[error("project tree has too many entries: {count} > {limit}")]
    TooManyEntries { count: usize, limit: usize },

    // =========================================================================
    // Platform Errors
    // =========================================================================
    /// Platform string could not be parsed.
    #[error("invalid platform '{0}': expected os/arch or os/arch/variant")]
    InvalidPlatform(String),

    /// Base image has no variant for a requested platform.
    #[error("base image '{reference}' has no manifest for platform {platform} (available: {available})")]
    MissingPlatform {
        reference: String,
        platform: Platform,
        available: String,
    },

    /// The same platform was requested more than once.
    #[error("platform {0} requested more than once")]
    DuplicatePlatform(Platform),

    // =========================================================================
    // Registry / Push Errors
    // =========================================================================
    /// Failed to parse image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Push failed after exhausting retries.
    #[error("failed to push '{reference}': {reason}")]
    PushFailed { reference: String, reason: String },

    // =========================================================================
    // Cancellation
    // =========================================================================
    /// Build was cancelled by the caller.
    #[error("build cancelled during {0}")]
    Cancelled(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
