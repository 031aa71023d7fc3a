//! # Deterministic Layer Construction
//!
//! Packs a validated set of filesystem entries into one reproducible
//! tar+gzip layer blob. Entries are written in the lexicographic order
//! produced by the walk, with timestamps and ownership zeroed, so an
//! unchanged source tree always yields a byte-identical blob and
//! therefore an identical digest.
//!
//! Two digests are computed in a single pass over the stream:
//!
//! - the **blob digest**, over the compressed bytes, which addresses
//!   the layer in manifests and the blob store;
//! - the **diff ID**, over the uncompressed tar bytes, which identifies
//!   the filesystem change in the image config independent of
//!   compression.
//!
//! Regular file content is streamed from disk through the tar encoder,
//! never buffered wholesale, and the compressed output streams into a
//! staging file that is committed to the store by atomic rename.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::constants::{MAX_LAYER_SIZE, OCI_LAYER_MEDIA_TYPE_GZIP};
use crate::error::{Error, Result};
use crate::manifest::Descriptor;
use crate::storage::{BlobStore, Digest};
use crate::walk::{EntryKind, FileEntry};

/// Handle to a built layer blob resident in the store.
#[derive(Debug, Clone)]
pub struct Layer {
    /// Digest of the compressed blob.
    pub digest: Digest,
    /// Digest of the uncompressed tar stream.
    pub diff_id: Digest,
    /// Compressed size in bytes.
    pub size: u64,
    /// Media type of the blob.
    pub media_type: &'static str,
}

impl Layer {
    /// Returns the manifest descriptor for this layer.
    pub fn descriptor(&self) -> Descriptor {
        Descriptor {
            media_type: self.media_type.to_string(),
            digest: self.digest.clone(),
            size: self.size,
            platform: None,
        }
    }
}

/// Builds layer blobs into a [`BlobStore`].
pub struct LayerBuilder<'a> {
    store: &'a BlobStore,
}

impl<'a> LayerBuilder<'a> {
    /// Creates a builder committing into `store`.
    pub fn new(store: &'a BlobStore) -> Self {
        Self { store }
    }

    /// Packs `entries` (resolved against `root`) into one layer blob.
    ///
    /// `entries` must come from [`crate::walk::collect_entries`], which
    /// guarantees validation and canonical ordering.
    pub fn build(&self, root: &Path, entries: &[FileEntry]) -> Result<Layer> {
        let staged = self.store.staging_path();
        let file = File::create(&staged).map_err(|e| Error::StorageWriteFailed(e.to_string()))?;

        let compressed = HashingWriter::new(BufWriter::new(file));
        let gz = GzEncoder::new(compressed, Compression::default());
        let uncompressed = HashingWriter::new(gz);
        let mut tar = tar::Builder::new(uncompressed);
        tar.follow_symlinks(false);

        for entry in entries {
            self.append(&mut tar, root, entry)
                .map_err(|e| Error::LayerBuildFailed(format!("{}: {}", entry.rel_path.display(), e)))?;
        }

        // Unwind the writer chain, finalizing the tar trailer and the
        // gzip stream before taking either digest.
        let uncompressed = tar
            .into_inner()
            .map_err(|e| Error::LayerBuildFailed(e.to_string()))?;
        let (diff_hasher, gz, _) = uncompressed.into_parts();
        let compressed = gz
            .finish()
            .map_err(|e| Error::LayerBuildFailed(e.to_string()))?;
        let (blob_hasher, mut out, size) = compressed.into_parts();
        out.flush().map_err(|e| Error::StorageWriteFailed(e.to_string()))?;
        drop(out);

        if size > MAX_LAYER_SIZE {
            let _ = std::fs::remove_file(&staged);
            return Err(Error::LayerTooLarge {
                size,
                limit: MAX_LAYER_SIZE,
            });
        }

        let digest = Digest::from_sha256(blob_hasher);
        let diff_id = Digest::from_sha256(diff_hasher);
        self.store.commit_file(&staged, &digest)?;

        info!(
            "built layer {} ({} entries, {} bytes compressed)",
            digest,
            entries.len(),
            size
        );

        Ok(Layer {
            digest,
            diff_id,
            size,
            media_type: OCI_LAYER_MEDIA_TYPE_GZIP,
        })
    }

    /// Appends one entry with zeroed timestamps and ownership.
    fn append<W: Write>(
        &self,
        tar: &mut tar::Builder<W>,
        root: &Path,
        entry: &FileEntry,
    ) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(entry.mode);

        let name = tar_name(entry);
        debug!("packing {}", name);

        match entry.kind {
            EntryKind::Dir => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                tar.append_data(&mut header, name, io::empty())
            }
            EntryKind::File => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(entry.size);
                let file = File::open(root.join(&entry.rel_path))?;
                tar.append_data(&mut header, name, file)
            }
            EntryKind::Symlink => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                let target = entry
                    .link_target
                    .as_deref()
                    .ok_or_else(|| io::Error::other("symlink entry without target"))?;
                tar.append_link(&mut header, name, target)
            }
        }
    }
}

/// Returns the entry's in-archive name with forward slashes and a
/// trailing slash for directories.
fn tar_name(entry: &FileEntry) -> String {
    let mut name = entry
        .rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    if entry.kind == EntryKind::Dir {
        name.push('/');
    }
    name
}

/// A writer that hashes and counts everything passing through it.
struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    fn into_parts(self) -> (Sha256, W, u64) {
        (self.hasher, self.inner, self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::walk::collect_entries;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/main.py"), b"print('hi')\n").unwrap();
        fs::write(dir.path().join("func.yaml"), b"name: hello\n").unwrap();
        dir
    }

    #[test]
    fn identical_trees_build_identical_blobs() {
        let tree = sample_tree();
        let store_dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(store_dir.path().to_path_buf()).unwrap();

        let entries = collect_entries(tree.path(), &[]).unwrap();
        let a = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();
        let b = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();

        assert_eq!(a.digest, b.digest);
        assert_eq!(a.diff_id, b.diff_id);
        assert_eq!(a.size, b.size);
    }

    #[test]
    fn content_change_changes_both_digests() {
        let tree = sample_tree();
        let store_dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(store_dir.path().to_path_buf()).unwrap();

        let entries = collect_entries(tree.path(), &[]).unwrap();
        let before = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();

        fs::write(tree.path().join("func.yaml"), b"name: changed\n").unwrap();
        let entries = collect_entries(tree.path(), &[]).unwrap();
        let after = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();

        assert_ne!(before.digest, after.digest);
        assert_ne!(before.diff_id, after.diff_id);
    }

    #[test]
    fn diff_id_is_digest_of_decompressed_stream() {
        let tree = sample_tree();
        let store_dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(store_dir.path().to_path_buf()).unwrap();

        let entries = collect_entries(tree.path(), &[]).unwrap();
        let layer = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();

        let compressed = store.get(&layer.digest).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut tar_bytes = Vec::new();
        std::io::Read::read_to_end(&mut decoder, &mut tar_bytes).unwrap();

        assert_eq!(Digest::of(&tar_bytes), layer.diff_id);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_preserved_verbatim() {
        let tree = sample_tree();
        std::os::unix::fs::symlink("func.yaml", tree.path().join("config.lnk")).unwrap();

        let store_dir = TempDir::new().unwrap();
        let store = BlobStore::with_path(store_dir.path().to_path_buf()).unwrap();

        let entries = collect_entries(tree.path(), &[]).unwrap();
        let layer = LayerBuilder::new(&store).build(tree.path(), &entries).unwrap();

        let compressed = store.get(&layer.digest).unwrap();
        let decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut archive = tar::Archive::new(decoder);

        let mut found = false;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.path().unwrap().as_ref() == Path::new("config.lnk") {
                assert_eq!(entry.header().entry_type(), tar::EntryType::Symlink);
                assert_eq!(
                    entry.link_name().unwrap().unwrap().as_ref(),
                    Path::new("func.yaml")
                );
                found = true;
            }
        }
        assert!(found, "symlink entry missing from archive");
    }
}
