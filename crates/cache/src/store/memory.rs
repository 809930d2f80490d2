//! Process-local metadata store

use super::table::Table;
use super::{CacheEntry, EntryId, EntryQuery, Expiration, MetadataStore};
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Process-local metadata store
#[derive(Debug, Default)]
pub struct MemoryStore {
    table: RwLock<Table>,
}

impl MemoryStore {
    /// An empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MetadataStore for MemoryStore {
    fn upsert(
        &self,
        key: &str,
        expiration: Expiration,
        result: serde_json::Value,
        tag: Option<&str>,
    ) -> Result<CacheEntry> {
        Ok(self.table.write().upsert(key, expiration, result, tag))
    }

    fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expiration: Option<Expiration>,
    ) -> Result<Option<CacheEntry>> {
        Ok(self.table.read().get(key, now, expiration))
    }

    fn record_hit(&self, id: &EntryId, tag: Option<&str>) -> Result<Option<CacheEntry>> {
        Ok(self.table.write().record_hit(id, tag))
    }

    fn query(&self, query: &EntryQuery) -> Result<Vec<CacheEntry>> {
        Ok(self.table.read().query(query))
    }

    fn delete(&self, ids: &[EntryId]) -> Result<usize> {
        Ok(self.table.write().delete(ids))
    }

    fn set_expiration(&self, ids: &[EntryId], expiration: Expiration) -> Result<usize> {
        Ok(self.table.write().set_expiration(ids, expiration))
    }
}
