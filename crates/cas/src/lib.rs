//! Content-addressed blob storage for callcache
//!
//! Large results (files, directory stores, arrays) are not kept inline in the
//! metadata store. They are written here once, named after their content,
//! and referenced from cache entries through a [`FileAsset`].
//!
//! - [`BlobStore`] writes blobs atomically and verifies them on read
//! - [`FileLock`] coordinates concurrent writers through `.lock` markers
//! - [`checksum`] hashes files and directory stores

#![expect(
    clippy::missing_errors_doc,
    reason = "Error documentation to be added incrementally"
)]

pub mod asset;
pub mod checksum;
mod error;
pub mod lock;
pub mod store;

pub use asset::{DIRECTORY_STORE_KIND, FileAsset, content_kind, extension_for};
pub use checksum::{checksum, token};
pub use error::{Error, Result};
pub use lock::{FileLock, LOCK_SUFFIX, LockGuard, LockSettings, LockTimeoutPolicy, lock_path};
pub use store::{BlobStore, TEMP_PREFIX, is_staging_path};
