//! # Content-Addressed Blob Storage
//!
//! Stores layer, config, manifest, and index blobs by their cryptographic
//! digest, deduplicating identical content within a build.
//!
//! ## Storage Model
//!
//! Blobs live in a `blobs/<algorithm>/<hex>` tree:
//!
//! ```text
//! <store>/blobs/
//! └── sha256/
//!     ├── abcd1234...  (blob content)
//!     └── cdef5678...  (blob content)
//! ```
//!
//! This is the same shape an OCI layout directory uses for its blob
//! side, so the exporter can hard-reference store contents directly.
//!
//! ## Digest Binding
//!
//! A digest is only ever computed from content ([`Digest::of`]), never
//! assigned externally. [`BlobStore::get`] re-hashes what it reads back
//! and surfaces a mismatch as a data-integrity failure rather than
//! silently recomputing: two blobs with equal digest must have
//! bit-identical content.
//!
//! ## Atomic Writes
//!
//! Blobs are written to a uniquely named temp file and renamed into
//! place. Concurrent puts of the same digest from different platform
//! workers use different temp files; the final rename is atomic, so a
//! concurrent reader never observes a partially written blob.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::constants::BLOBS_DIR;
use crate::error::{Error, Result};

/// A cryptographic content digest in `sha256:<hex>` form.
///
/// The only constructors are [`Digest::of`] (hash some content) and
/// [`Digest::parse`] (validate an externally supplied string, e.g. from
/// a base image manifest). Validation guarantees the digest is safe to
/// embed in a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Computes the digest of `content`.
    pub fn of(content: &[u8]) -> Self {
        Self(format!("sha256:{}", hex::encode(Sha256::digest(content))))
    }

    /// Wraps a finished SHA-256 hasher.
    pub(crate) fn from_sha256(hasher: Sha256) -> Self {
        Self(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Parses and validates a digest string.
    ///
    /// Only `sha256` with a 64-character lowercase hex value is
    /// accepted; anything else is rejected before it can influence a
    /// blob path.
    pub fn parse(s: &str) -> Result<Self> {
        let (algo, hash) = s.split_once(':').ok_or_else(|| Error::Serialization(format!(
            "invalid digest '{}': missing algorithm",
            s
        )))?;
        if algo != "sha256" {
            return Err(Error::Serialization(format!(
                "invalid digest '{}': unsupported algorithm '{}'",
                s, algo
            )));
        }
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::Serialization(format!(
                "invalid digest '{}': malformed hex value",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the full `sha256:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the hash algorithm name.
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("sha256")
    }

    /// Returns the hex-encoded hash value.
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or(&self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, String> {
        Digest::parse(&s).map_err(|e| e.to_string())
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> String {
        d.0
    }
}

/// Content-addressed blob store for image blobs.
///
/// ## Thread Safety
///
/// `BlobStore` is safe to share across platform workers. Each operation
/// is independent, and atomic renames prevent corruption from
/// concurrent puts of the same blob.
pub struct BlobStore {
    /// Store root; blobs live under `<base_dir>/blobs`.
    base_dir: PathBuf,
}

impl BlobStore {
    /// Creates a blob store at the default path.
    pub fn new() -> Result<Self> {
        Self::with_path(Self::default_path())
    }

    /// Creates a blob store rooted at `base_dir`.
    pub fn with_path(base_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(base_dir.join(BLOBS_DIR)).map_err(|e| Error::StorageInitFailed {
            path: base_dir.clone(),
            reason: e.to_string(),
        })?;

        info!("blob store initialized at {}", base_dir.display());
        Ok(Self { base_dir })
    }

    /// Returns the default storage path.
    fn default_path() -> PathBuf {
        if let Some(home) = dirs::home_dir() {
            home.join(".ocibuild")
        } else {
            PathBuf::from(".ocibuild")
        }
    }

    /// Returns the store root.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Returns the on-disk path for a digest (`blobs/<algorithm>/<hex>`).
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.base_dir
            .join(BLOBS_DIR)
            .join(digest.algorithm())
            .join(digest.hex())
    }

    /// Checks whether a blob exists.
    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Stores `content` and returns its digest.
    ///
    /// If a blob with the same digest already exists the put is a
    /// no-op: content-addressing makes rewriting pointless.
    pub fn put(&self, content: &[u8]) -> Result<Digest> {
        let digest = Digest::of(content);
        let path = self.blob_path(&digest);

        if path.exists() {
            debug!("blob {} already stored", digest);
            return Ok(digest);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        let tmp = self.staging_path();
        fs::write(&tmp, content).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("stored blob {} ({} bytes)", digest, content.len());
        Ok(digest)
    }

    /// Retrieves a blob, verifying its content against the digest key.
    ///
    /// # Errors
    ///
    /// - [`Error::BlobNotFound`] if the digest is not stored.
    /// - [`Error::DigestMismatch`] if the read-back content no longer
    ///   hashes to the key. Corruption is surfaced, never repaired.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        let content = fs::read(&path).map_err(|_| Error::BlobNotFound {
            digest: digest.to_string(),
        })?;

        let computed = Digest::of(&content);
        if &computed != digest {
            return Err(Error::DigestMismatch {
                digest: digest.to_string(),
                computed: computed.to_string(),
            });
        }

        Ok(content)
    }

    /// Returns a unique path for staging a blob before commit.
    ///
    /// Used by the layer builder to stream compressed output to disk;
    /// the file is moved into place by [`BlobStore::commit_file`].
    pub fn staging_path(&self) -> PathBuf {
        self.base_dir
            .join(BLOBS_DIR)
            .join(format!("tmp.{}", uuid::Uuid::now_v7()))
    }

    /// Atomically moves a fully written staging file into place under
    /// `digest`.
    ///
    /// The caller must have computed `digest` over exactly the file's
    /// content. If the blob already exists the staging file is
    /// discarded.
    pub fn commit_file(&self, staged: &Path, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);

        if path.exists() {
            debug!("blob {} already stored, discarding staging file", digest);
            let _ = fs::remove_file(staged);
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        }

        fs::rename(staged, &path).map_err(|e| {
            let _ = fs::remove_file(staged);
            Error::StorageWriteFailed(e.to_string())
        })?;

        debug!("committed blob {}", digest);
        Ok(())
    }
}
