//! Deterministic enumeration of regular files under a directory tree.
//!
//! The walker's sort is the only ordering primitive the whole pipeline
//! depends on: leaf position, and therefore the root hash, follows directly
//! from it. Paths are compared byte-wise on their absolute form, which is
//! stable and locale-independent.
//!
//! Symlink policy: an entry that resolves to a regular file is included;
//! directory symlinks are not followed (cycle safety).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Result of one directory scan.
#[derive(Debug, Clone)]
pub struct Scan {
    /// Regular files, sorted lexicographically by absolute path.
    pub files: Vec<PathBuf>,
    /// True when `batch_limit` cut the sorted list short.
    pub truncated: bool,
}

/// Recursively enumerate regular files under `root`.
///
/// `batch_limit` truncates the sorted list to the first N entries, capping
/// the cost of a single build; the caller decides whether truncation is
/// worth a warning.
///
/// Errors: `Io` when the root is inaccessible or a subdirectory cannot be
/// read (a silently skipped directory would corrupt the root hash), `Empty`
/// when no files are discovered.
pub fn walk(root: &Path, batch_limit: Option<usize>) -> Result<Scan> {
    let root = std::path::absolute(root)
        .map_err(|e| Error::Io(format!("cannot resolve {}: {e}", root.display())))?;

    let meta = fs::metadata(&root)
        .map_err(|e| Error::Io(format!("source directory {} inaccessible: {e}", root.display())))?;
    if !meta.is_dir() {
        return Err(Error::Io(format!("{} is not a directory", root.display())));
    }

    let mut files = Vec::new();
    collect(&root, &mut files)?;

    if files.is_empty() {
        return Err(Error::Empty(format!("no files discovered under {}", root.display())));
    }

    files.sort();

    let mut truncated = false;
    if let Some(limit) = batch_limit {
        if files.len() > limit {
            debug!(total = files.len(), limit, "truncating file list");
            files.truncate(limit);
            truncated = true;
        }
    }

    Ok(Scan { files, truncated })
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Io(format!("cannot read directory {}: {e}", dir.display())))?;

    for entry in entries {
        let entry =
            entry.map_err(|e| Error::Io(format!("cannot read entry in {}: {e}", dir.display())))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| Error::Io(format!("cannot stat {}: {e}", path.display())))?;

        if file_type.is_dir() {
            collect(&path, out)?;
        } else {
            // Follows file symlinks; anything that isn't a regular file
            // after resolution (sockets, fifos, dangling links) is skipped.
            match fs::metadata(&path) {
                Ok(m) if m.is_file() => out.push(path),
                _ => {}
            }
        }
    }

    Ok(())
}
