//! Cache engine
//!
//! Wraps functions so that repeated calls with identical arguments are served
//! from the metadata store:
//!
//! ```text
//! fingerprint -> lookup -> hit:  decode ---------------------------> return
//!                       -> miss: invoke -> encode -> store -> decode -> return
//! ```
//!
//! The cache never blocks a caller: fingerprint and encode failures fall back
//! to the live result, and entries that fail to decode are deleted and
//! recomputed.

use crate::config::Settings;
use crate::fingerprint::{CallableRef, fingerprint};
use crate::registry::{Context, Registry};
use crate::store::{CacheEntry, Expiration, MetadataStore};
use crate::value::{Args, Value};
use crate::{Error, Result};
use callcache_cas::{BlobStore, FileAsset};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Removal attempts for the files of an entry that failed to decode
const EVICT_REMOVE_ATTEMPTS: usize = 3;

/// Hit and miss counters of one engine
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    /// Lookups served from the store
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that had to invoke the function
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// How a call was answered
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// Decoded from an existing entry
    Hit(Value),
    /// Computed, stored, and decoded back from the stored tree
    Stored(Value),
    /// Computed and returned as is, without touching the store
    Uncached(Value),
    /// The metadata entry, when `return_cache_entry` is set
    Entry(CacheEntry),
}

impl CallOutcome {
    /// The value handed to the caller
    ///
    /// An entry is rendered as a map of its fields.
    pub fn into_value(self) -> Result<Value> {
        match self {
            Self::Hit(v) | Self::Stored(v) | Self::Uncached(v) => Ok(v),
            Self::Entry(entry) => Ok(Value::from_json(&serde_json::to_value(entry)?)),
        }
    }

    /// Whether the result came from the store
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

/// Memoizes calls against a metadata store and a blob store
///
/// Cloning is cheap; clones share the store, the registry and the counters.
#[derive(Debug, Clone)]
pub struct CacheEngine {
    settings: Arc<Settings>,
    store: Arc<dyn MetadataStore>,
    registry: Arc<Registry>,
    blobs: BlobStore,
    stats: Arc<CacheStats>,
}

impl CacheEngine {
    /// Build an engine; `settings` are validated first
    pub fn new(
        settings: Settings,
        store: Arc<dyn MetadataStore>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        settings.validate()?;
        let blobs = settings.blob_store();
        Ok(Self {
            settings: Arc::new(settings),
            store,
            registry,
            blobs,
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// Same store and registry under different settings
    pub fn with_settings(&self, settings: Settings) -> Result<Self> {
        settings.validate()?;
        let blobs = settings.blob_store();
        Ok(Self {
            settings: Arc::new(settings),
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            blobs,
            stats: Arc::clone(&self.stats),
        })
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Metadata store
    #[must_use]
    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    /// Serialization registry
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Blob store
    #[must_use]
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Hit and miss counters
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Encoding context for this engine
    #[must_use]
    pub fn context(&self) -> Context<'_> {
        Context::new(&self.settings, &self.blobs)
    }

    /// Wrap `func` under an explicit `module:qualname` reference
    pub fn cacheable<F, E>(&self, reference: &str, func: F) -> Result<Cacheable<F>>
    where
        F: Fn(&Args) -> std::result::Result<Value, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Ok(Cacheable {
            engine: self.clone(),
            reference: CallableRef::parse(reference)?,
            func,
        })
    }

    /// Wrap a function item, naming it after its path
    pub fn cacheable_fn<F, E>(&self, func: F) -> Result<Cacheable<F>>
    where
        F: Fn(&Args) -> std::result::Result<Value, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Ok(Cacheable {
            engine: self.clone(),
            reference: CallableRef::of::<F>()?,
            func,
        })
    }

    /// Run one call through the cache
    pub fn call_outcome<F, E>(
        &self,
        reference: &CallableRef,
        func: &F,
        args: &Args,
    ) -> Result<CallOutcome>
    where
        F: Fn(&Args) -> std::result::Result<Value, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let invoke = || {
            func(args).map_err(|e| Error::Callable {
                name: reference.to_string(),
                source: e.into(),
            })
        };

        if !self.settings.use_cache {
            return invoke().map(CallOutcome::Uncached);
        }

        let ctx = self.context();
        let digest = match fingerprint(&self.registry, &ctx, reference, args) {
            Ok(fp) => fp.digest,
            Err(e) if e.is_fatal() || self.settings.raise_all_encoding_errors => return Err(e),
            Err(e) => {
                warn!(callable = %reference, "Cannot encode call, running uncached: {e}");
                return invoke().map(CallOutcome::Uncached);
            }
        };

        if let Some(outcome) = self.lookup(reference, &digest, &ctx)? {
            return Ok(outcome);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(callable = %reference, key = %digest, "Cache miss");
        let value = invoke()?;
        let tree = match self.registry.encode(&value, &ctx) {
            Ok(tree) => tree,
            Err(e) if e.is_fatal() || self.settings.raise_all_encoding_errors => return Err(e),
            Err(e) => {
                warn!(callable = %reference, "Cannot encode output, returning it uncached: {e}");
                return Ok(CallOutcome::Uncached(value));
            }
        };

        let entry = self.store.upsert(
            &digest,
            self.settings.entry_expiration(),
            tree,
            self.settings.tag.as_deref(),
        )?;
        debug!(
            callable = %reference,
            key = %digest,
            counter = entry.counter,
            "Stored result"
        );
        if self.settings.return_cache_entry {
            return Ok(CallOutcome::Entry(entry));
        }
        self.registry
            .decode(&entry.result, &ctx)
            .map(CallOutcome::Stored)
    }

    /// Run one call and return its value
    pub fn call<F, E>(&self, reference: &CallableRef, func: &F, args: &Args) -> Result<Value>
    where
        F: Fn(&Args) -> std::result::Result<Value, E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.call_outcome(reference, func, args)?.into_value()
    }

    /// Serve a live entry, deleting the ones that no longer decode
    fn lookup(
        &self,
        reference: &CallableRef,
        digest: &str,
        ctx: &Context<'_>,
    ) -> Result<Option<CallOutcome>> {
        let expiration = self.settings.expiration.map(Expiration::At);
        while let Some(entry) = self.store.get(digest, Utc::now(), expiration)? {
            match self.registry.decode(&entry.result, ctx) {
                Ok(value) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    let updated = self
                        .store
                        .record_hit(&entry.id(), self.settings.tag.as_deref())?
                        .unwrap_or(entry);
                    debug!(
                        callable = %reference,
                        key = %digest,
                        counter = updated.counter,
                        "Cache hit"
                    );
                    return Ok(Some(if self.settings.return_cache_entry {
                        CallOutcome::Entry(updated)
                    } else {
                        CallOutcome::Hit(value)
                    }));
                }
                Err(e) if e.is_decode_failure() => {
                    warn!(
                        callable = %reference,
                        key = %digest,
                        "Discarding cache entry that cannot be decoded: {e}"
                    );
                    if !self.evict(&entry)? {
                        break;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Delete an entry, then its files inside the blob root; false when it
    /// was already gone
    fn evict(&self, entry: &CacheEntry) -> Result<bool> {
        let deleted = self.store.delete(&[entry.id()])?;
        for asset in file_assets(&entry.result) {
            let path = asset.path();
            if !self.blobs.contains(path) || !path.exists() {
                continue;
            }
            if let Err(e) = self.blobs.remove_with_retry(path, EVICT_REMOVE_ATTEMPTS) {
                warn!(path = %path.display(), "Cannot remove file of discarded entry: {e}");
            }
        }
        Ok(deleted > 0)
    }
}

/// File assets referenced anywhere in a result tree
#[must_use]
pub fn file_assets(tree: &serde_json::Value) -> Vec<FileAsset> {
    fn walk(node: &serde_json::Value, out: &mut Vec<FileAsset>) {
        if let Some(asset) = FileAsset::from_json(node) {
            out.push(asset);
            return;
        }
        match node {
            serde_json::Value::Array(items) => items.iter().for_each(|i| walk(i, out)),
            serde_json::Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut out = Vec::new();
    walk(tree, &mut out);
    out
}

/// A function bound to a cache engine
#[derive(Debug)]
pub struct Cacheable<F> {
    engine: CacheEngine,
    reference: CallableRef,
    func: F,
}

impl<F, E> Cacheable<F>
where
    F: Fn(&Args) -> std::result::Result<Value, E>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    /// Call through the cache
    pub fn call(&self, args: &Args) -> Result<Value> {
        self.engine.call(&self.reference, &self.func, args)
    }

    /// Call through the cache, reporting how the call was answered
    pub fn call_outcome(&self, args: &Args) -> Result<CallOutcome> {
        self.engine.call_outcome(&self.reference, &self.func, args)
    }

    /// Call the wrapped function directly
    pub fn call_uncached(&self, args: &Args) -> std::result::Result<Value, E> {
        (self.func)(args)
    }

    /// Stable reference the calls are fingerprinted under
    #[must_use]
    pub fn reference(&self) -> &CallableRef {
        &self.reference
    }

    /// The engine calls go through
    #[must_use]
    pub fn engine(&self) -> &CacheEngine {
        &self.engine
    }
}
