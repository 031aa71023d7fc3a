//! # Project Tree Walk and Symlink Validation
//!
//! Walks a function project's source tree and produces the validated,
//! deterministically ordered set of filesystem entries that the layer
//! builder packs. This module is the load-bearing security control
//! against the "tar-slip" defect class: a symlink whose target resolves
//! outside the project root must never be embedded in a layer, because
//! extracting such a layer could overwrite files outside the intended
//! container filesystem.
//!
//! ## Validation Rules
//!
//! Regular files and directories are always valid (subject to the
//! caller-supplied ignore patterns). Symlinks are classified by target:
//!
//! | Target | Verdict |
//! |--------|---------|
//! | Absolute path (including `c:/...` drive forms) | invalid |
//! | Resolves to the project root or below it | valid |
//! | Resolves to the root's immediate parent | invalid |
//! | Resolves above the parent | invalid |
//!
//! The comparison is derived from the lexically normalized resolved path
//! versus the normalized root, not from counting `..` segments: a link
//! that traverses upward through subdirectories and back down is valid
//! as long as its final location is at or below the root. Dot-prefixed
//! entry names are not special-cased.
//!
//! ## Traversal Model
//!
//! The walk is an explicit worklist over directories, returning a
//! validation result per node. Any invalid entry fails the whole walk;
//! there is no partial inclusion.

use std::collections::VecDeque;
use std::fs;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, trace};

use crate::constants::MAX_ENTRIES_PER_LAYER;
use crate::error::{Error, Result};

/// Kind of a validated filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Dir,
    /// Symbolic link (validated to stay within the project root).
    Symlink,
}

/// One validated filesystem entry, relative to the project root.
///
/// Produced only by [`collect_entries`]; the layer builder consumes
/// these verbatim.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Path relative to the project root, normalized, no `..` segments.
    pub rel_path: PathBuf,
    /// Entry kind.
    pub kind: EntryKind,
    /// File mode bits (permissions only).
    pub mode: u32,
    /// Size in bytes (regular files only; zero otherwise).
    pub size: u64,
    /// Raw symlink target, preserved verbatim (symlinks only).
    pub link_target: Option<String>,
}

/// Walks `root` and returns all included entries in lexicographic path
/// order.
///
/// `ignores` is the pattern list supplied by the build orchestrator. A
/// pattern excludes an entry when it equals the entry's relative path or
/// any single path component (so `node_modules` excludes the directory
/// at any depth). Excluded directories are not descended into.
///
/// # Errors
///
/// - [`Error::AbsoluteSymlink`] / [`Error::SymlinkEscape`] on the first
///   invalid symlink; the whole walk fails.
/// - [`Error::UnreadableEntry`] if a directory or link cannot be read.
/// - [`Error::TooManyEntries`] if the tree exceeds the per-layer bound.
pub fn collect_entries(root: &Path, ignores: &[String]) -> Result<Vec<FileEntry>> {
    let root_abs = lexical_clean(&absolutize(root));
    let mut entries = Vec::new();
    let mut worklist: VecDeque<PathBuf> = VecDeque::new();
    worklist.push_back(root_abs.clone());

    while let Some(dir) = worklist.pop_front() {
        let reader = fs::read_dir(&dir).map_err(|e| Error::UnreadableEntry {
            path: dir.clone(),
            reason: e.to_string(),
        })?;

        for child in reader {
            let child = child.map_err(|e| Error::UnreadableEntry {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            let path = child.path();
            let rel = path
                .strip_prefix(&root_abs)
                .expect("walked path is under root")
                .to_path_buf();

            if is_ignored(&rel, ignores) {
                trace!("ignoring {}", rel.display());
                continue;
            }

            // Lstat: the walk never follows symlinks.
            let meta = fs::symlink_metadata(&path).map_err(|e| Error::UnreadableEntry {
                path: path.clone(),
                reason: e.to_string(),
            })?;

            if meta.file_type().is_symlink() {
                let target = fs::read_link(&path).map_err(|e| Error::UnreadableEntry {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                let target = target.to_string_lossy().into_owned();
                validate_symlink(&root_abs, &path, &target)?;
                entries.push(FileEntry {
                    rel_path: rel,
                    kind: EntryKind::Symlink,
                    mode: 0o777,
                    size: 0,
                    link_target: Some(target),
                });
            } else if meta.is_dir() {
                entries.push(FileEntry {
                    rel_path: rel,
                    kind: EntryKind::Dir,
                    mode: mode_of(&meta, 0o755),
                    size: 0,
                    link_target: None,
                });
                worklist.push_back(path);
            } else {
                entries.push(FileEntry {
                    rel_path: rel,
                    kind: EntryKind::File,
                    mode: mode_of(&meta, 0o644),
                    size: meta.len(),
                    link_target: None,
                });
            }

            if entries.len() > MAX_ENTRIES_PER_LAYER {
                return Err(Error::TooManyEntries {
                    count: entries.len(),
                    limit: MAX_ENTRIES_PER_LAYER,
                });
            }
        }
    }

    // Canonical order: lexicographic by relative path. This, not the
    // directory read order, is what makes layer digests reproducible.
    entries.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));

    debug!(
        "collected {} entries under {}",
        entries.len(),
        root.display()
    );
    Ok(entries)
}

/// Validates a symlink's target against the project root.
///
/// `root` and `link_path` may be relative; both are absolutized and
/// lexically normalized before comparison. The resolved target must be
/// the root itself or a path strictly inside it. The root's immediate
/// parent is the exact escape boundary and is rejected.
pub fn validate_symlink(root: &Path, link_path: &Path, target: &str) -> Result<()> {
    if is_absolute_target(target) {
        return Err(Error::AbsoluteSymlink {
            path: link_path.to_path_buf(),
            target: target.to_string(),
        });
    }

    let root_abs = lexical_clean(&absolutize(root));
    let link_abs = lexical_clean(&absolutize(link_path));
    let link_dir = link_abs.parent().unwrap_or(&root_abs);
    let resolved = lexical_clean(&link_dir.join(target));

    if resolved == root_abs || resolved.starts_with(&root_abs) {
        Ok(())
    } else {
        Err(Error::SymlinkEscape {
            path: link_path.to_path_buf(),
            resolved,
        })
    }
}

/// Returns true if the raw target string is absolute.
///
/// Windows drive-letter forms (`c:/...`, `C:\...`) are treated as
/// absolute on every host: a link whose target depends on the host
/// filesystem layout is never embeddable.
fn is_absolute_target(target: &str) -> bool {
    if target.starts_with('/') || target.starts_with('\\') {
        return true;
    }
    let bytes = target.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Absolutizes a path against the current directory without touching the
/// filesystem.
fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    }
}

/// Lexically normalizes a path: removes `.` segments and resolves `..`
/// against the preceding component. `..` at the filesystem root stays
/// at the root. No symlink resolution is performed; the security
/// comparison is over the path as written.
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Returns true if the relative path matches any ignore pattern.
fn is_ignored(rel: &Path, ignores: &[String]) -> bool {
    for pattern in ignores {
        let pattern = pattern.trim_end_matches('/');
        if rel.as_os_str() == pattern {
            return true;
        }
        if rel.components().any(|c| c.as_os_str() == pattern) {
            return true;
        }
    }
    false
}

/// Returns the permission bits of `meta`, or `fallback` on hosts without
/// unix modes.
#[cfg(unix)]
fn mode_of(meta: &fs::Metadata, _fallback: u32) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(_meta: &fs::Metadata, fallback: u32) -> u32 {
    fallback
}
