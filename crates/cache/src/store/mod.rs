//! Metadata store
//!
//! One [`CacheEntry`] per `(key, expiration)` pair. The engine and the
//! cleaner only talk to the [`MetadataStore`] trait; two backends ship with
//! the crate:
//!
//! - [`MemoryStore`]: process-local, for tests and short-lived tools
//! - [`JsonFileStore`]: a single JSON document guarded by an advisory file
//!   lock, shared by every process pointing at the same path

mod json_file;
mod memory;
mod table;

pub use json_file::JsonFileStore;
pub use memory::MemoryStore;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// When an entry stops being served
///
/// Every `At(_)` orders before `Never`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Option<DateTime<Utc>>", into = "Option<DateTime<Utc>>")]
pub enum Expiration {
    /// Expires at this instant
    At(DateTime<Utc>),
    /// Never expires
    Never,
}

impl Expiration {
    /// Whether the entry is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::At(at) => *at <= now,
            Self::Never => false,
        }
    }
}

impl From<Option<DateTime<Utc>>> for Expiration {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(Self::Never, Self::At)
    }
}

impl From<Expiration> for Option<DateTime<Utc>> {
    fn from(value: Expiration) -> Self {
        match value {
            Expiration::At(at) => Some(at),
            Expiration::Never => None,
        }
    }
}

/// Primary key of an entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId {
    /// Call digest
    pub key: String,
    /// Generation
    pub expiration: Expiration,
}

/// A stored call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Call digest
    pub key: String,
    /// Generation of this entry
    pub expiration: Expiration,
    /// Encoded result tree
    pub result: serde_json::Value,
    /// First write
    pub created_at: DateTime<Utc>,
    /// Last write or hit
    pub updated_at: DateTime<Utc>,
    /// Number of writes and hits
    pub counter: u64,
    /// Optional label used by maintenance operations
    pub tag: Option<String>,
}

impl CacheEntry {
    /// Primary key
    #[must_use]
    pub fn id(&self) -> EntryId {
        EntryId {
            key: self.key.clone(),
            expiration: self.expiration,
        }
    }
}

/// Tag predicate; `None` in a list stands for untagged entries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    /// Only entries whose tag is listed
    Include(Vec<Option<String>>),
    /// Only entries whose tag is not listed
    Exclude(Vec<Option<String>>),
}

impl TagFilter {
    /// Whether an entry with `tag` passes
    #[must_use]
    pub fn matches(&self, tag: Option<&str>) -> bool {
        let listed = |tags: &[Option<String>]| tags.iter().any(|t| t.as_deref() == tag);
        match self {
            Self::Include(tags) => listed(tags),
            Self::Exclude(tags) => !listed(tags),
        }
    }
}

/// Ordering of query results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EntryOrder {
    /// By primary key
    #[default]
    Key,
    /// Least recently used first: `(updated_at, counter, expiration)`
    Lru,
    /// Least frequently used first: `(counter, updated_at, expiration)`
    Lfu,
    /// Most recently updated first
    NewestFirst,
}

impl EntryOrder {
    fn compare(self, a: &CacheEntry, b: &CacheEntry) -> Ordering {
        match self {
            Self::Key => a.id().cmp(&b.id()),
            Self::Lru => (a.updated_at, a.counter, a.expiration)
                .cmp(&(b.updated_at, b.counter, b.expiration)),
            Self::Lfu => (a.counter, a.updated_at, a.expiration)
                .cmp(&(b.counter, b.updated_at, b.expiration)),
            Self::NewestFirst => b.updated_at.cmp(&a.updated_at),
        }
    }
}

/// Filters, ordering and limit of a [`MetadataStore::query`]
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    /// Tag predicate
    pub tags: Option<TagFilter>,
    /// Only entries already expired at this instant
    pub expired_at: Option<DateTime<Utc>>,
    /// Only entries created strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Only entries created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Result ordering
    pub order: EntryOrder,
    /// Maximum number of entries returned
    pub limit: Option<usize>,
}

impl EntryQuery {
    /// Whether `entry` passes every filter
    #[must_use]
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        self.tags
            .as_ref()
            .is_none_or(|f| f.matches(entry.tag.as_deref()))
            && self
                .expired_at
                .is_none_or(|at| entry.expiration.is_expired_at(at))
            && self.created_before.is_none_or(|t| entry.created_at < t)
            && self.created_after.is_none_or(|t| entry.created_at >= t)
    }

    /// Filter, sort and truncate a candidate set
    #[must_use]
    pub fn apply<'a>(&self, entries: impl IntoIterator<Item = &'a CacheEntry>) -> Vec<CacheEntry> {
        let mut selected: Vec<CacheEntry> = entries
            .into_iter()
            .filter(|e| self.matches(e))
            .cloned()
            .collect();
        selected.sort_by(|a, b| self.order.compare(a, b));
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// Persistence of cache entries
///
/// Each method is one atomic operation of the backend.
pub trait MetadataStore: Send + Sync + std::fmt::Debug {
    /// Insert an entry with `counter = 1`, or refresh an existing one
    ///
    /// Refreshing replaces `result`, bumps `counter`, sets `updated_at` and
    /// overwrites `tag` when one is given.
    fn upsert(
        &self,
        key: &str,
        expiration: Expiration,
        result: serde_json::Value,
        tag: Option<&str>,
    ) -> Result<CacheEntry>;

    /// Newest entry for `key` not expired at `now`
    ///
    /// With `expiration`, only that generation is considered.
    fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expiration: Option<Expiration>,
    ) -> Result<Option<CacheEntry>>;

    /// Count a hit: bump `counter`, refresh `updated_at`, overwrite `tag` when given
    fn record_hit(&self, id: &EntryId, tag: Option<&str>) -> Result<Option<CacheEntry>>;

    /// Entries matching `query`
    fn query(&self, query: &EntryQuery) -> Result<Vec<CacheEntry>>;

    /// Remove entries; returns how many existed
    fn delete(&self, ids: &[EntryId]) -> Result<usize>;

    /// Move entries to another generation; returns how many moved
    ///
    /// When the target generation is already taken, the most recently
    /// updated of the two entries survives.
    fn set_expiration(&self, ids: &[EntryId], expiration: Expiration) -> Result<usize>;
}

pub(crate) fn newest_live<'a>(
    entries: impl IntoIterator<Item = &'a CacheEntry>,
    key: &str,
    now: DateTime<Utc>,
    expiration: Option<Expiration>,
) -> Option<CacheEntry> {
    entries
        .into_iter()
        .filter(|e| e.key == key && !e.expiration.is_expired_at(now))
        .filter(|e| expiration.is_none_or(|exp| e.expiration == exp))
        .max_by_key(|e| e.updated_at)
        .cloned()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiration_order_and_serde() {
        let at = Utc::now();
        assert!(Expiration::At(at) < Expiration::Never);
        assert!(Expiration::At(at) < Expiration::At(at + chrono::TimeDelta::seconds(1)));
        assert_eq!(serde_json::to_value(Expiration::Never).unwrap(), serde_json::Value::Null);
        let back: Expiration =
            serde_json::from_value(serde_json::to_value(Expiration::At(at)).unwrap()).unwrap();
        assert_eq!(back, Expiration::At(at));
    }

    #[test]
    fn test_expired_is_inclusive() {
        let now = Utc::now();
        assert!(Expiration::At(now).is_expired_at(now));
        assert!(!Expiration::Never.is_expired_at(now));
    }

    #[test]
    fn test_tag_filter_none_matches_untagged() {
        let filter = TagFilter::Include(vec![None]);
        assert!(filter.matches(None));
        assert!(!filter.matches(Some("a")));
        let filter = TagFilter::Exclude(vec![Some("keep".into())]);
        assert!(filter.matches(None));
        assert!(!filter.matches(Some("keep")));
    }
}
