//! Error types for the blob store

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for blob store operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during blob operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(callcache::cas::io),
        help("Check file permissions and ensure the cache directory exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "rename", "remove_file")
        operation: String,
    },

    /// A blob with the same content address already exists with different content
    #[error("Blob {path} already exists with checksum {existing}, refusing to overwrite with {incoming}")]
    #[diagnostic(
        code(callcache::cas::consistency),
        help("Content-addressed names must map to identical content; the store is inconsistent")
    )]
    Consistency {
        /// Path of the conflicting blob
        path: PathBuf,
        /// Checksum of the blob already on disk
        existing: String,
        /// Checksum of the content being written
        incoming: String,
    },

    /// A stored blob no longer matches its recorded checksum
    #[error("Checksum mismatch for {path}: expected {expected}, found {actual}")]
    #[diagnostic(code(callcache::cas::checksum_mismatch))]
    ChecksumMismatch {
        /// Path of the blob
        path: PathBuf,
        /// Recorded checksum
        expected: String,
        /// Checksum computed from disk
        actual: String,
    },

    /// Neither the local path nor the href of a blob exists
    #[error("No such file or directory: {local_path} nor {href}")]
    #[diagnostic(
        code(callcache::cas::missing),
        help("The blob may have been evicted or removed outside of callcache")
    )]
    Missing {
        /// Recorded local path
        local_path: String,
        /// Recorded href
        href: String,
    },

    /// A lock marker was not released in time
    #[error("{path} is locked by {lockfile} (waited {waited:?})")]
    #[diagnostic(
        code(callcache::cas::lock_timeout),
        help("Another process may still be writing this blob; stale markers expire after the lock validity period")
    )]
    LockTimeout {
        /// Path of the blob being waited on
        path: PathBuf,
        /// Path of the lock marker
        lockfile: PathBuf,
        /// How long the caller waited
        waited: Duration,
    },

    /// Invalid input
    #[error("Validation error: {message}")]
    #[diagnostic(code(callcache::cas::validation))]
    Validation {
        /// Error message describing the validation issue
        message: String,
    },
}

impl Error {
    /// Create an I/O error with path context
    #[must_use]
    pub fn io(
        source: std::io::Error,
        path: impl AsRef<Path>,
        operation: impl Into<String>,
    ) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// True for errors that mean the blob cannot be trusted (corrupt or gone)
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. } | Self::Missing { .. })
    }

    /// True for errors that must never be retried or swallowed
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Consistency { .. } | Self::LockTimeout { .. })
    }
}

/// Result type for blob store operations
pub type Result<T> = std::result::Result<T, Error>;
