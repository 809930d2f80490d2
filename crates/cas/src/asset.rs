//! File assets embedded in cached results

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Content kind of directory-shaped (chunked) stores
pub const DIRECTORY_STORE_KIND: &str = "application/vnd+zarr";

/// Content kind used when the extension is not recognized
pub const UNKNOWN_KIND: &str = "unknown";

const KINDS: &[(&str, &str)] = &[
    ("nc", "application/netcdf"),
    ("grib", "application/x-grib"),
    ("grb", "application/x-grib"),
    ("grb1", "application/x-grib"),
    ("grb2", "application/x-grib"),
    ("zarr", DIRECTORY_STORE_KIND),
    ("json", "application/json"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("bin", "application/octet-stream"),
    ("ndarray", "application/x-ndarray"),
];

/// Guess the content kind of a path from its extension
#[must_use]
pub fn content_kind(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| {
            let ext = ext.to_ascii_lowercase();
            KINDS.iter().find(|(e, _)| *e == ext).map(|(_, kind)| *kind)
        })
        .unwrap_or(UNKNOWN_KIND)
}

/// Preferred extension (with leading dot) for a content kind
#[must_use]
pub fn extension_for(kind: &str) -> Option<&'static str> {
    match kind {
        "application/netcdf" => Some(".nc"),
        "application/x-grib" => Some(".grib"),
        DIRECTORY_STORE_KIND => Some(".zarr"),
        "application/json" => Some(".json"),
        "text/plain" => Some(".txt"),
        "text/csv" => Some(".csv"),
        "application/octet-stream" => Some(".bin"),
        "application/x-ndarray" => Some(".ndarray"),
        _ => None,
    }
}

/// Description of a blob-backed value
///
/// Serialized with the same keys the metadata store has always used, so
/// stored results stay readable by older and newer writers alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAsset {
    /// Content kind (MIME-like tag)
    #[serde(rename = "type")]
    pub content_kind: String,
    /// Externally resolvable locator
    pub href: String,
    /// Checksum of the blob content
    #[serde(rename = "file:checksum")]
    pub checksum: String,
    /// Size in bytes (recursive for directory stores)
    #[serde(rename = "file:size")]
    pub size: u64,
    /// Path of the blob on the local filesystem
    #[serde(rename = "file:local_path")]
    pub local_path: String,
}

impl FileAsset {
    /// Exact key set of a serialized asset
    pub const KEYS: [&'static str; 5] = [
        "type",
        "href",
        "file:checksum",
        "file:size",
        "file:local_path",
    ];

    /// Recognize a serialized asset inside an arbitrary JSON tree
    ///
    /// Only objects with exactly the asset keys qualify.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.len() != Self::KEYS.len() || !Self::KEYS.iter().all(|k| obj.contains_key(*k)) {
            return None;
        }
        serde_json::from_value(value.clone()).ok()
    }

    /// Local path as a [`Path`]
    #[must_use]
    pub fn path(&self) -> &Path {
        Path::new(&self.local_path)
    }
}
