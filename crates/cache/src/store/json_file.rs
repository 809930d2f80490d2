//! Metadata store persisted across process runs
//!
//! The document is `{"version": 1, "entries": [...]}`; concurrent processes
//! serialize on an advisory lock held for the whole read-modify-write.

use super::table::Table;
use super::{CacheEntry, EntryId, EntryQuery, Expiration, MetadataStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const FORMAT_VERSION: u32 = 1;
const LOCK_EXTENSION: &str = "flock";

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u32,
    entries: Table,
}

/// Metadata store persisted as one JSON document
///
/// Every operation takes an advisory lock on a sibling `.flock` file, reads
/// the document, and for writes replaces it through a temporary file and a
/// rename. Keep the document outside the blob root so cleaning never sees it.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
    lockfile: PathBuf,
}

impl JsonFileStore {
    /// Store backed by the document at `path`, created on first write
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lockfile = path.clone().into_os_string();
        lockfile.push(".");
        lockfile.push(LOCK_EXTENSION);
        Self {
            path,
            lockfile: lockfile.into(),
        }
    }

    /// Location of the document
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self, exclusive: bool) -> Result<File> {
        if let Some(parent) = self.lockfile.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create"))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lockfile)
            .map_err(|e| Error::io(e, &self.lockfile, "open"))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| Error::io(e, &self.lockfile, "lock"))?;
        // Released when the handle is dropped
        Ok(file)
    }

    fn load(&self) -> Result<Table> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Table::default()),
            Err(e) => return Err(Error::io(e, &self.path, "read")),
        };
        let document: Document = serde_json::from_str(&text).map_err(|e| {
            Error::store(format!("{} is not a metadata document: {e}", self.path.display()))
        })?;
        if document.version != FORMAT_VERSION {
            return Err(Error::store(format!(
                "{} has format version {}, expected {FORMAT_VERSION}",
                self.path.display(),
                document.version
            )));
        }
        Ok(document.entries)
    }

    fn save(&self, table: Table) -> Result<()> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let document = Document {
            version: FORMAT_VERSION,
            entries: table,
        };
        let mut temp =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| Error::io(e, dir, "create"))?;
        serde_json::to_writer(&mut temp, &document)?;
        temp.flush().map_err(|e| Error::io(e, temp.path(), "write"))?;
        temp.persist(&self.path)
            .map_err(|e| Error::io(e.error, &self.path, "rename"))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Table) -> T) -> Result<T> {
        let _lock = self.lock(false)?;
        let table = self.load()?;
        Ok(f(&table))
    }

    fn update<T>(&self, f: impl FnOnce(&mut Table) -> T) -> Result<T> {
        let _lock = self.lock(true)?;
        let mut table = self.load()?;
        let out = f(&mut table);
        self.save(table)?;
        Ok(out)
    }
}

impl MetadataStore for JsonFileStore {
    fn upsert(
        &self,
        key: &str,
        expiration: Expiration,
        result: serde_json::Value,
        tag: Option<&str>,
    ) -> Result<CacheEntry> {
        self.update(|t| t.upsert(key, expiration, result, tag))
    }

    fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expiration: Option<Expiration>,
    ) -> Result<Option<CacheEntry>> {
        self.read(|t| t.get(key, now, expiration))
    }

    fn record_hit(&self, id: &EntryId, tag: Option<&str>) -> Result<Option<CacheEntry>> {
        self.update(|t| t.record_hit(id, tag))
    }

    fn query(&self, query: &EntryQuery) -> Result<Vec<CacheEntry>> {
        self.read(|t| t.query(query))
    }

    fn delete(&self, ids: &[EntryId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.update(|t| t.delete(ids))
    }

    fn set_expiration(&self, ids: &[EntryId], expiration: Expiration) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.update(|t| t.set_expiration(ids, expiration))
    }
}
