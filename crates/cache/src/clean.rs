//! Cache maintenance
//!
//! Keeps the blob root under a size bound and removes stale entries:
//!
//! - [`clean_cache_files`] evicts entries (LRU or LFU) and their files until
//!   disk usage fits `maxsize`, optionally sweeping unreferenced files first
//! - [`clean_invalid_cache_entries`] deletes expired entries and entries that
//!   no longer decode
//! - [`expire_cache_entries`] soft-expires or deletes entries by tag and
//!   creation time
//!
//! Deletions run in short batches: metadata first, then files.

use crate::engine::{CacheEngine, file_assets};
use crate::store::{CacheEntry, EntryId, EntryOrder, EntryQuery, Expiration, TagFilter};
use crate::{Error, Result};
use callcache_cas::lock::{is_marker_expired, locked_target};
use callcache_cas::{is_staging_path, lock_path};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Eviction order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionMethod {
    /// Least recently used first
    #[default]
    Lru,
    /// Least frequently used first
    Lfu,
}

impl EvictionMethod {
    const fn order(self) -> EntryOrder {
        match self {
            Self::Lru => EntryOrder::Lru,
            Self::Lfu => EntryOrder::Lfu,
        }
    }
}

/// Parameters of [`clean_cache_files`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanOptions {
    /// Target size of the blob root in bytes
    pub maxsize: u64,
    /// Eviction order
    pub method: EvictionMethod,
    /// Delete files no entry references, unless a live lock marker guards them
    pub delete_unknown_files: bool,
    /// Age after which lock markers stop guarding; `None` guards forever
    pub lock_validity_period: Option<Duration>,
    /// Only evict entries with these tags (`None` matches untagged entries)
    pub tags_to_clean: Option<Vec<Option<String>>>,
    /// Never evict entries with these tags (`None` matches untagged entries)
    pub tags_to_keep: Option<Vec<Option<String>>>,
    /// Path components below the root that form one accounting unit
    pub depth: usize,
    /// Account from the assets referenced by entries instead of listing the root
    pub use_database: bool,
    /// Entries per deletion batch; `None` deletes everything at once
    pub batch_size: Option<usize>,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Attempts per file removal
    pub max_remove_attempts: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            maxsize: 0,
            method: EvictionMethod::Lru,
            delete_unknown_files: false,
            lock_validity_period: None,
            tags_to_clean: None,
            tags_to_keep: None,
            depth: 1,
            use_database: false,
            batch_size: None,
            batch_delay: Duration::ZERO,
            max_remove_attempts: 5,
        }
    }
}

impl CleanOptions {
    /// Default options with the given size bound
    #[must_use]
    pub fn new(maxsize: u64) -> Self {
        Self {
            maxsize,
            ..Self::default()
        }
    }

    /// Reject contradictory options before anything is deleted
    pub fn validate(&self) -> Result<()> {
        if self.tags_to_clean.is_some() && self.tags_to_keep.is_some() {
            return Err(Error::validation(
                "tags_to_clean/keep are mutually exclusive",
            ));
        }
        if self.delete_unknown_files && self.use_database {
            return Err(Error::validation(
                "delete_unknown_files and use_database are mutually exclusive",
            ));
        }
        if self.depth == 0 {
            return Err(Error::validation("depth must be at least 1"));
        }
        if self.batch_size == Some(0) {
            return Err(Error::validation("batch_size must be positive"));
        }
        if self.max_remove_attempts == 0 {
            return Err(Error::validation("max_remove_attempts must be positive"));
        }
        Ok(())
    }

    fn tag_filter(&self) -> Option<TagFilter> {
        self.tags_to_clean
            .clone()
            .map(TagFilter::Include)
            .or_else(|| self.tags_to_keep.clone().map(TagFilter::Exclude))
    }
}

/// Outcome of [`clean_cache_files`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanReport {
    /// Metadata entries deleted
    pub entries_deleted: usize,
    /// Files and directories removed, unknown ones included
    pub files_deleted: usize,
    /// Bytes accounted to removed units
    pub bytes_freed: u64,
    /// Usage left after the pass
    pub final_usage: u64,
}

/// Parameters of [`expire_cache_entries`]
#[derive(Debug, Clone, Default)]
pub struct ExpireOptions {
    /// Only entries with these tags (`None` matches untagged entries)
    pub tags: Option<Vec<Option<String>>>,
    /// Only entries created strictly before this instant
    pub before: Option<DateTime<Utc>>,
    /// Only entries created at or after this instant
    pub after: Option<DateTime<Utc>>,
    /// Delete instead of setting the expiration to now
    pub delete: bool,
    /// Only count
    pub dry_run: bool,
    /// Entries per batch; `None` handles everything at once
    pub batch_size: Option<usize>,
    /// Pause between batches
    pub batch_delay: Duration,
}

/// One entry scheduled for deletion with the files to remove after it
#[derive(Debug)]
struct Doomed {
    id: EntryId,
    files: Vec<PathBuf>,
}

/// Accounting unit of `path`: its first `depth` components below `root`
fn unit_of(root: &Path, path: &Path, depth: usize) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    let prefix: PathBuf = rel.components().take(depth).collect();
    if prefix.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(prefix))
}

/// Units of the files an entry references
fn entry_units(entry: &CacheEntry, root: &Path, depth: usize) -> Vec<PathBuf> {
    file_assets(&entry.result)
        .iter()
        .filter_map(|asset| unit_of(root, asset.path(), depth))
        .collect()
}

/// Take the tracked units at or below `unit`, returning their total size
///
/// A directory blob shallower than `depth` is tracked as its children.
fn take_tracked(sizes: &mut BTreeMap<PathBuf, u64>, unit: &Path) -> Option<u64> {
    let keys: Vec<PathBuf> = sizes
        .keys()
        .filter(|k| k.starts_with(unit))
        .cloned()
        .collect();
    if keys.is_empty() {
        return None;
    }
    Some(keys.iter().filter_map(|k| sizes.remove(k)).sum())
}

fn database_usage(entries: &[CacheEntry], root: &Path, depth: usize) -> BTreeMap<PathBuf, u64> {
    let mut seen = HashSet::new();
    let mut sizes = BTreeMap::new();
    for asset in entries.iter().flat_map(|e| file_assets(&e.result)) {
        let Some(unit) = unit_of(root, asset.path(), depth) else {
            continue;
        };
        if seen.insert(asset.local_path.clone()) {
            *sizes.entry(unit).or_insert(0) += asset.size;
        }
    }
    sizes
}

/// Whether a lock marker (or a writer's staging directory) protects `unit`
fn is_guarded(root: &Path, unit: &Path, validity: Option<Duration>) -> Result<bool> {
    let marker = if locked_target(unit).is_some() || is_staging_path(root, unit) {
        unit.to_path_buf()
    } else {
        let marker = lock_path(unit);
        if !marker.exists() {
            return Ok(false);
        }
        marker
    };
    Ok(!is_marker_expired(&marker, validity)?)
}

fn delete_in_batches(
    engine: &CacheEngine,
    doomed: &[Doomed],
    batch_size: Option<usize>,
    batch_delay: Duration,
    attempts: usize,
) -> Result<(usize, usize)> {
    let size = batch_size.unwrap_or(doomed.len()).max(1);
    let mut entries_deleted = 0;
    let mut files_deleted = 0;
    for (i, batch) in doomed.chunks(size).enumerate() {
        if i > 0 && !batch_delay.is_zero() {
            std::thread::sleep(batch_delay);
        }
        let ids: Vec<EntryId> = batch.iter().map(|d| d.id.clone()).collect();
        info!(n_entries = ids.len(), "deleting cache entries");
        entries_deleted += engine.store().delete(&ids)?;

        let files: Vec<&PathBuf> = batch.iter().flat_map(|d| &d.files).collect();
        if files.is_empty() {
            continue;
        }
        info!(n_files_to_delete = files.len(), "deleting files");
        for path in files {
            if engine.blobs().remove_with_retry(path, attempts)? {
                files_deleted += 1;
            }
        }
    }
    Ok((entries_deleted, files_deleted))
}

/// Bring the blob root under `options.maxsize`
///
/// Entries are evicted in LRU or LFU order. An entry is evicted while usage
/// exceeds the bound and it owns a tracked file, or when it shares a file
/// with an entry evicted earlier in the same pass. Fails with
/// [`Error::EvictionShortfall`] when the bound cannot be reached.
pub fn clean_cache_files(engine: &CacheEngine, options: &CleanOptions) -> Result<CleanReport> {
    options.validate()?;
    let blobs = engine.blobs();
    let root = blobs.root();
    let depth = options.depth;
    let mut report = CleanReport::default();

    let all_entries = engine.store().query(&EntryQuery::default())?;
    let mut sizes = if options.use_database {
        database_usage(&all_entries, root, depth)
    } else {
        blobs.disk_usage(depth)?
    };
    let mut usage: u64 = sizes.values().sum();
    info!(disk_usage = usage, "check disk usage");

    if options.delete_unknown_files {
        let known: HashSet<PathBuf> = all_entries
            .iter()
            .flat_map(|e| entry_units(e, root, depth))
            .collect();
        let unknown: Vec<PathBuf> = sizes
            .keys()
            .filter(|unit| !known.iter().any(|k| unit.starts_with(k)))
            .cloned()
            .collect();
        for unit in unknown {
            if is_guarded(root, &unit, options.lock_validity_period)? {
                debug!(path = %unit.display(), "Keeping locked file");
                continue;
            }
            info!(path = %unit.display(), "deleting unknown file");
            if blobs.remove_with_retry(&unit, options.max_remove_attempts)? {
                report.files_deleted += 1;
            }
            if let Some(size) = sizes.remove(&unit) {
                usage -= size;
                report.bytes_freed += size;
            }
        }
        info!(disk_usage = usage, "check disk usage");
    }

    if usage > options.maxsize {
        let candidates = engine.store().query(&EntryQuery {
            tags: options.tag_filter(),
            order: options.method.order(),
            ..EntryQuery::default()
        })?;
        let mut scheduled: BTreeSet<PathBuf> = BTreeSet::new();
        let mut doomed = Vec::new();
        for entry in &candidates {
            let units = entry_units(entry, root, depth);
            let owns_tracked = units
                .iter()
                .any(|u| sizes.keys().any(|k| k.starts_with(u)));
            let shares_scheduled = units
                .iter()
                .any(|u| scheduled.iter().any(|s| u.starts_with(s) || s.starts_with(u)));
            if !((usage > options.maxsize && owns_tracked) || shares_scheduled) {
                continue;
            }
            let mut files = Vec::new();
            for unit in units {
                if let Some(size) = take_tracked(&mut sizes, &unit) {
                    usage -= size;
                    report.bytes_freed += size;
                    scheduled.insert(unit.clone());
                    files.push(unit);
                }
            }
            doomed.push(Doomed {
                id: entry.id(),
                files,
            });
        }

        let (entries, files) = delete_in_batches(
            engine,
            &doomed,
            options.batch_size,
            options.batch_delay,
            options.max_remove_attempts,
        )?;
        report.entries_deleted += entries;
        report.files_deleted += files;
        info!(disk_usage = usage, "check disk usage");
    }

    report.final_usage = usage;
    if usage > options.maxsize {
        warn!(
            dir = %root.display(),
            disk_usage = usage,
            maxsize = options.maxsize,
            "Cleaning did not reach the target size"
        );
        return Err(Error::EvictionShortfall {
            dir: root.to_path_buf(),
            usage,
            maxsize: options.maxsize,
        });
    }
    Ok(report)
}

/// Files inside the blob root an entry references
fn owned_files(engine: &CacheEngine, entry: &CacheEntry) -> Vec<PathBuf> {
    file_assets(&entry.result)
        .into_iter()
        .map(|asset| asset.path().to_path_buf())
        .filter(|path| engine.blobs().contains(path))
        .collect()
}

/// Delete expired entries and, with `try_decode`, entries that no longer decode
///
/// Their files are removed with them. Returns the number of deleted entries.
pub fn clean_invalid_cache_entries(
    engine: &CacheEngine,
    check_expiration: bool,
    try_decode: bool,
    batch_size: Option<usize>,
    batch_delay: Duration,
) -> Result<usize> {
    if batch_size == Some(0) {
        return Err(Error::validation("batch_size must be positive"));
    }
    let attempts = CleanOptions::default().max_remove_attempts;
    let mut deleted = 0;

    if check_expiration {
        let expired = engine.store().query(&EntryQuery {
            expired_at: Some(Utc::now()),
            ..EntryQuery::default()
        })?;
        let doomed: Vec<Doomed> = expired
            .iter()
            .map(|e| Doomed {
                id: e.id(),
                files: owned_files(engine, e),
            })
            .collect();
        deleted += delete_in_batches(engine, &doomed, batch_size, batch_delay, attempts)?.0;
    }

    if try_decode {
        let ctx = engine.context();
        let mut doomed = Vec::new();
        for entry in engine.store().query(&EntryQuery::default())? {
            match engine.registry().decode(&entry.result, &ctx) {
                Ok(_) => {}
                Err(e) if e.is_decode_failure() => {
                    warn!(key = %entry.key, "Deleting cache entry that cannot be decoded: {e}");
                    doomed.push(Doomed {
                        id: entry.id(),
                        files: owned_files(engine, &entry),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        deleted += delete_in_batches(engine, &doomed, batch_size, batch_delay, attempts)?.0;
    }

    Ok(deleted)
}

/// Expire live entries matching a tag and creation-time window
///
/// Matching entries get `expiration = now`, or are deleted with their files
/// when `delete` is set. With `dry_run` nothing changes. Returns the number
/// of matching entries.
pub fn expire_cache_entries(engine: &CacheEngine, options: &ExpireOptions) -> Result<usize> {
    if options.batch_size == Some(0) {
        return Err(Error::validation("batch_size must be positive"));
    }
    let now = Utc::now();
    let matching: Vec<CacheEntry> = engine
        .store()
        .query(&EntryQuery {
            tags: options.tags.clone().map(TagFilter::Include),
            created_before: options.before,
            created_after: options.after,
            ..EntryQuery::default()
        })?
        .into_iter()
        .filter(|e| !e.expiration.is_expired_at(now))
        .collect();
    let count = matching.len();
    if options.dry_run || count == 0 {
        info!(count, dry_run = options.dry_run, "expiring cache entries");
        return Ok(count);
    }

    if options.delete {
        let doomed: Vec<Doomed> = matching
            .iter()
            .map(|e| Doomed {
                id: e.id(),
                files: owned_files(engine, e),
            })
            .collect();
        let attempts = CleanOptions::default().max_remove_attempts;
        delete_in_batches(
            engine,
            &doomed,
            options.batch_size,
            options.batch_delay,
            attempts,
        )?;
    } else {
        let ids: Vec<EntryId> = matching.iter().map(CacheEntry::id).collect();
        let size = options.batch_size.unwrap_or(ids.len()).max(1);
        for (i, batch) in ids.chunks(size).enumerate() {
            if i > 0 && !options.batch_delay.is_zero() {
                std::thread::sleep(options.batch_delay);
            }
            engine.store().set_expiration(batch, Expiration::At(now))?;
        }
    }
    info!(count, delete = options.delete, "expiring cache entries");
    Ok(count)
}
