//! Content-addressed blob store
//!
//! Blobs live flat under a root directory and are named
//! `<content-address><ext>`. Writers materialize into a private temporary
//! directory inside the root and rename into place while holding the blob's
//! lock marker, so readers never observe a half-written blob.
//!
//! ```text
//! <root>/
//!   9f86d0818...c15d.nc
//!   a3b1e52c6...77f0.zarr/        (directory store)
//!   e3b0c4429...b855.txt.lock     (write in progress)
//! ```

use crate::asset::{FileAsset, content_kind};
use crate::checksum::checksum;
use crate::lock::{FileLock, LockSettings};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Name prefix of the private staging directories writers create under the root
pub const TEMP_PREFIX: &str = ".tmp-";

const REMOVE_BACKOFF: Duration = Duration::from_millis(20);

/// Whether `path` is (inside) a writer's staging directory
#[must_use]
pub fn is_staging_path(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .ok()
        .and_then(|rel| rel.components().next())
        .and_then(|c| match c {
            Component::Normal(name) => name.to_str(),
            _ => None,
        })
        .is_some_and(|name| name.starts_with(TEMP_PREFIX))
}

/// Content-addressed blob store rooted at a directory
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    href_base: Option<String>,
    locks: LockSettings,
}

impl BlobStore {
    /// Create a store at the given root directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            href_base: None,
            locks: LockSettings::default(),
        }
    }

    /// Use a read-only URL prefix when building asset hrefs
    #[must_use]
    pub fn with_href_base(mut self, href_base: Option<String>) -> Self {
        self.href_base = href_base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    /// Override lock marker timing
    #[must_use]
    pub fn with_lock_settings(mut self, locks: LockSettings) -> Self {
        self.locks = locks;
        self
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Lock marker timing used by this store
    #[must_use]
    pub fn lock_settings(&self) -> LockSettings {
        self.locks
    }

    /// Lock handle for a path of this store
    #[must_use]
    pub fn lock(&self, path: &Path) -> FileLock {
        FileLock::new(path, self.locks)
    }

    /// Whether `path` lies under the store root
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Create the root directory if needed
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| Error::io(e, &self.root, "create_dir_all"))
    }

    /// Store a file or directory under the checksum of its content
    ///
    /// The source extension is kept. With `delete_original` the source is
    /// moved instead of copied.
    pub fn put_file(&self, src: &Path, delete_original: bool) -> Result<FileAsset> {
        let key = checksum(src)?;
        let ext = src
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        self.put_with(&key, &ext, |staged| {
            if delete_original {
                move_path(src, staged)
            } else {
                copy_path(src, staged)
            }
        })
    }

    /// Store content produced by `write` under a caller-supplied address
    ///
    /// `write` receives the staging path to create (file or directory). An
    /// existing blob with the same name is reused when its checksum matches
    /// the staged content and is a fatal [`Error::Consistency`] otherwise.
    pub fn put_with<F>(&self, key: &str, ext: &str, write: F) -> Result<FileAsset>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if key.is_empty() || key.contains(['/', '\\']) {
            return Err(Error::validation(format!("invalid content address {key:?}")));
        }
        self.ensure_root()?;
        let name = format!("{key}{ext}");
        let target = self.root.join(&name);

        let lock = self.lock(&target);
        let _guard = lock.acquire()?;

        let staging = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(&self.root)
            .map_err(|e| Error::io(e, &self.root, "create_staging_dir"))?;
        let staged = staging.path().join(&name);
        write(&staged)?;
        let incoming = checksum(&staged)?;

        if target.exists() {
            let existing = checksum(&target)?;
            if existing != incoming {
                return Err(Error::Consistency {
                    path: target,
                    existing,
                    incoming,
                });
            }
            trace!(path = %target.display(), "Blob already stored");
        } else {
            fs::rename(&staged, &target).map_err(|e| Error::io(e, &target, "rename"))?;
            debug!(path = %target.display(), checksum = %incoming, "Stored blob");
        }

        self.describe(&target, incoming)
    }

    fn describe(&self, path: &Path, checksum: String) -> Result<FileAsset> {
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let href = match &self.href_base {
            Some(base) => format!("{base}/{basename}"),
            None => path.display().to_string(),
        };
        Ok(FileAsset {
            content_kind: content_kind(path).to_string(),
            href,
            checksum,
            size: self.size(path)?,
            local_path: path.display().to_string(),
        })
    }

    /// Checksum of a blob on disk
    pub fn checksum(&self, path: &Path) -> Result<String> {
        checksum(path)
    }

    /// Whether a path exists
    #[must_use]
    pub fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Size of a file, or the sum of file sizes under a directory
    pub fn size(&self, path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
        if !metadata.is_dir() {
            return Ok(metadata.len());
        }
        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(path) {
            let entry = entry.map_err(|e| Error::io(e.into(), path, "walk"))?;
            if entry.file_type().is_file() {
                total += entry
                    .metadata()
                    .map_err(|e| Error::io(e.into(), entry.path(), "metadata"))?
                    .len();
            }
        }
        Ok(total)
    }

    /// Remove a blob: a file, or a whole directory tree
    ///
    /// The shape on disk decides, not the recorded content kind. Symlinks
    /// are removed, never followed.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let is_dir = fs::symlink_metadata(path)
            .map_err(|e| Error::io(e, path, "metadata"))?
            .is_dir();
        let outcome = if is_dir {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        };
        outcome.map_err(|e| Error::io(e, path, "remove"))
    }

    /// Remove a path, tolerating concurrent removers
    ///
    /// Returns `Ok(false)` when the path was already gone. "Not found"
    /// failures are retried while the path still exists; other failures are
    /// retried up to `attempts` times before being surfaced.
    pub fn remove_with_retry(&self, path: &Path, attempts: usize) -> Result<bool> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.remove(path) {
                Ok(()) => return Ok(true),
                Err(err) => err,
            };
            let not_found = matches!(
                &err,
                Error::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound
            );
            if not_found && !path.exists() {
                trace!(path = %path.display(), "Already removed");
                return Ok(false);
            }
            if attempt >= attempts {
                return Err(err);
            }
            warn!(
                path = %path.display(),
                attempt,
                attempts,
                "Retrying removal: {err}"
            );
            std::thread::sleep(REMOVE_BACKOFF * u32::try_from(attempt).unwrap_or(u32::MAX));
        }
    }

    /// Resolve an asset to a verified local path
    ///
    /// Waits for an active writer, then recomputes the checksum of the local
    /// path (or of the href when it names a local file) and compares it with
    /// the recorded one.
    pub fn verify(&self, asset: &FileAsset) -> Result<PathBuf> {
        let local = asset.path();
        self.lock(local).wait_until_released()?;

        let candidates = std::iter::once(local.to_path_buf()).chain(href_to_path(&asset.href));
        for candidate in candidates {
            if !candidate.exists() {
                continue;
            }
            let actual = checksum(&candidate)?;
            if actual != asset.checksum {
                return Err(Error::ChecksumMismatch {
                    path: candidate,
                    expected: asset.checksum.clone(),
                    actual,
                });
            }
            return Ok(candidate);
        }
        Err(Error::Missing {
            local_path: asset.local_path.clone(),
            href: asset.href.clone(),
        })
    }

    /// Sizes of every file under the root grouped by path prefix
    ///
    /// Keys are the paths truncated to `depth` components below the root;
    /// `depth = 1` yields one unit per blob (directory stores included).
    pub fn disk_usage(&self, depth: usize) -> Result<BTreeMap<PathBuf, u64>> {
        if depth == 0 {
            return Err(Error::validation("depth must be at least 1"));
        }
        let mut sizes = BTreeMap::new();
        if !self.root.exists() {
            return Ok(sizes);
        }
        for entry in walkdir::WalkDir::new(&self.root).min_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                // Entries can vanish under concurrent writers and cleaners
                Err(e) if e.io_error().is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) => {
                    continue;
                }
                Err(e) => return Err(Error::io(e.into(), &self.root, "walk")),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let key: PathBuf = self.root.join(rel.components().take(depth).collect::<PathBuf>());
            let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
            *sizes.entry(key).or_insert(0) += len;
        }
        Ok(sizes)
    }
}

/// Interpret an href as a local path when it is one
fn href_to_path(href: &str) -> Option<PathBuf> {
    let path = href.strip_prefix("file://").unwrap_or(href);
    if path.contains("://") {
        return None;
    }
    let path = PathBuf::from(path);
    path.is_absolute().then_some(path)
}

fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    let metadata = fs::metadata(src).map_err(|e| Error::io(e, src, "metadata"))?;
    if !metadata.is_dir() {
        fs::copy(src, dst).map_err(|e| Error::io(e, dst, "copy"))?;
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::io(e.into(), src, "walk"))?;
        let rel = entry.path().strip_prefix(src).map_err(|_| {
            Error::validation(format!(
                "path {} is not under {}",
                entry.path().display(),
                src.display()
            ))
        })?;
        let out = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&out).map_err(|e| Error::io(e, &out, "create_dir_all"))?;
        } else {
            fs::copy(entry.path(), &out).map_err(|e| Error::io(e, &out, "copy"))?;
        }
    }
    Ok(())
}

fn move_path(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        // Cross-device moves fall back to copy + delete
        Err(_) => {
            copy_path(src, dst)?;
            let outcome = if src.is_dir() {
                fs::remove_dir_all(src)
            } else {
                fs::remove_file(src)
            };
            outcome.map_err(|e| Error::io(e, src, "remove_original"))
        }
    }
}
