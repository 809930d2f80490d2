//! Call memoization for expensive, idempotent functions
//!
//! Results are kept across process runs, indexed by a digest of the call:
//! - [`fingerprint`]: canonical JSON and SHA-224 digest of a call
//! - [`registry`]: round-trip encoding of values into JSON-safe tagged trees,
//!   with large results (files, arrays) moved to the content-addressed
//!   [`callcache_cas::BlobStore`]
//! - [`store`]: the [`MetadataStore`] trait plus in-memory and JSON-file backends
//! - [`engine`]: the [`CacheEngine`] wrapping functions as [`Cacheable`]s
//! - [`clean`]: size-bounded eviction and expiration maintenance
//!
//! # Example
//!
//! ```no_run
//! use callcache::{Args, CacheEngine, MemoryStore, Registry, Settings, Value};
//! use std::sync::Arc;
//!
//! # fn main() -> callcache::Result<()> {
//! let engine = CacheEngine::new(
//!     Settings::from_env()?,
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(Registry::with_defaults()),
//! )?;
//! let square = engine.cacheable("demo.math:square", |args: &Args| -> callcache::Result<Value> {
//!     let x = args.get(0).and_then(Value::as_i64).unwrap_or_default();
//!     Ok(Value::Int(x * x))
//! })?;
//! assert_eq!(square.call(&Args::new().arg(12))?, Value::Int(144));
//! # Ok(())
//! # }
//! ```

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod clean;
pub mod config;
pub mod engine;
mod error;
pub mod fingerprint;
pub mod logging;
pub mod registry;
pub mod store;
pub mod value;

pub use error::{Error, Result};

pub use clean::{
    CleanOptions, CleanReport, EvictionMethod, ExpireOptions, clean_cache_files,
    clean_invalid_cache_entries, expire_cache_entries,
};
pub use config::Settings;
pub use engine::{CacheEngine, CacheStats, CallOutcome, Cacheable, file_assets};
pub use fingerprint::{CallFingerprint, CallableRef, fingerprint, hexdigest};
pub use logging::{LogConfig, LogFormat, init_tracing};
pub use registry::{Context, Registry, TypeKey};
pub use store::{
    CacheEntry, EntryId, EntryOrder, EntryQuery, Expiration, JsonFileStore, MemoryStore,
    MetadataStore, TagFilter,
};
pub use value::{Args, CachedFile, Callable, NdArray, Opaque, Reconstruction, Value};
