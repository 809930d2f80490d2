//! Checksums for files and directory stores
//!
//! Single files are hashed byte-for-byte. Directory stores (e.g. zarr-like
//! chunked stores) get a structural digest over their sorted relative paths
//! and the digests of the files they contain, so two directories with the
//! same layout and content hash identically wherever they live.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

const BUFFER_SIZE: usize = 64 * 1024;

/// Compute the checksum of a file or directory store
pub fn checksum(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    if metadata.is_dir() {
        directory_checksum(path)
    } else {
        file_checksum(path)
    }
}

/// SHA-256 of a single file, streamed
pub fn file_checksum(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| Error::io(e, path, "open"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| Error::io(e, path, "read"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn directory_checksum(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in walkdir::WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            Error::io(e.into(), path, "walk")
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).map_err(|_| {
            Error::validation(format!(
                "path {} is not under {}",
                entry.path().display(),
                root.display()
            ))
        })?;
        // Normalize separators so the digest does not depend on the platform
        let rel = rel.to_string_lossy().replace('\\', "/");
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update(file_checksum(entry.path())?.as_bytes());
        hasher.update(b"\n");
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Digest a sequence of byte chunks into a content-address token
///
/// Used when hashing the materialized bytes would be wasteful and a cheaper
/// structural description of the content is available.
#[must_use]
pub fn token<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}
