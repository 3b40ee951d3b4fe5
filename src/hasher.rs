//! SHA-256 hashing of data blocks and file contents.
//!
//! Everything downstream (tree builder, proof engine, change gate) works on
//! the lowercase hex form of the digest, so the hex string is the canonical
//! hash representation throughout the crate.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Error, Result};

/// Read buffer for streaming file hashes.
const CHUNK_SIZE: usize = 4096;

/// SHA-256 of the UTF-8 bytes of `data`, as a 64-char lowercase hex string.
#[must_use]
pub fn hash_bytes(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Streaming SHA-256 of a file's contents.
///
/// Reads sequentially in 4 KiB chunks so arbitrarily large files hash in
/// constant memory. The file is hashed as-is; no line-ending canonicalization.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Io(format!("cannot open {}: {e}", path.display())))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| Error::Io(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
