//! In-memory entry table shared by the store backends

use super::{CacheEntry, EntryId, EntryQuery, Expiration};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

/// Entries keyed by `(key, expiration)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<CacheEntry>", into = "Vec<CacheEntry>")]
pub(crate) struct Table {
    entries: BTreeMap<EntryId, CacheEntry>,
    clock: Option<DateTime<Utc>>,
}

impl From<Vec<CacheEntry>> for Table {
    fn from(entries: Vec<CacheEntry>) -> Self {
        let clock = entries.iter().map(|e| e.updated_at).max();
        Self {
            entries: entries.into_iter().map(|e| (e.id(), e)).collect(),
            clock,
        }
    }
}

impl From<Table> for Vec<CacheEntry> {
    fn from(table: Table) -> Self {
        table.entries.into_values().collect()
    }
}

impl Table {
    /// Wall clock, nudged forward so every write gets a distinct timestamp
    fn tick(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.clock {
            Some(last) if now <= last => last + TimeDelta::microseconds(1),
            _ => now,
        };
        self.clock = Some(stamp);
        stamp
    }

    pub(crate) fn upsert(
        &mut self,
        key: &str,
        expiration: Expiration,
        result: serde_json::Value,
        tag: Option<&str>,
    ) -> CacheEntry {
        let now = self.tick();
        let id = EntryId {
            key: key.to_string(),
            expiration,
        };
        match self.entries.entry(id) {
            Entry::Occupied(mut slot) => {
                let e = slot.get_mut();
                e.result = result;
                e.counter += 1;
                e.updated_at = now;
                if let Some(tag) = tag {
                    e.tag = Some(tag.to_string());
                }
                e.clone()
            }
            Entry::Vacant(slot) => slot
                .insert(CacheEntry {
                    key: key.to_string(),
                    expiration,
                    result,
                    created_at: now,
                    updated_at: now,
                    counter: 1,
                    tag: tag.map(str::to_string),
                })
                .clone(),
        }
    }

    pub(crate) fn get(
        &self,
        key: &str,
        now: DateTime<Utc>,
        expiration: Option<Expiration>,
    ) -> Option<CacheEntry> {
        super::newest_live(self.entries.values(), key, now, expiration)
    }

    pub(crate) fn record_hit(&mut self, id: &EntryId, tag: Option<&str>) -> Option<CacheEntry> {
        if !self.entries.contains_key(id) {
            return None;
        }
        let now = self.tick();
        let entry = self.entries.get_mut(id)?;
        entry.counter += 1;
        entry.updated_at = now;
        if let Some(tag) = tag {
            entry.tag = Some(tag.to_string());
        }
        Some(entry.clone())
    }

    pub(crate) fn query(&self, query: &EntryQuery) -> Vec<CacheEntry> {
        query.apply(self.entries.values())
    }

    pub(crate) fn delete(&mut self, ids: &[EntryId]) -> usize {
        ids.iter()
            .filter(|id| self.entries.remove(id).is_some())
            .count()
    }

    pub(crate) fn set_expiration(&mut self, ids: &[EntryId], expiration: Expiration) -> usize {
        let mut moved = 0;
        for id in ids {
            if id.expiration == expiration {
                moved += usize::from(self.entries.contains_key(id));
                continue;
            }
            let Some(mut entry) = self.entries.remove(id) else {
                continue;
            };
            moved += 1;
            entry.expiration = expiration;
            let target = entry.id();
            match self.entries.get(&target) {
                Some(existing) if existing.updated_at >= entry.updated_at => {}
                _ => {
                    self.entries.insert(target, entry);
                }
            }
        }
        moved
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
