//! Error types for the cache crate

// Rust 1.92 compiler bug: false positives for thiserror/miette derive macro fields
// https://github.com/rust-lang/rust/issues/147648
#![allow(unused_assignments)]

use miette::Diagnostic;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for cache operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// I/O error during cache operations
    #[error("I/O {operation} failed{}", path.as_ref().map_or(String::new(), |p| format!(": {}", p.display())))]
    #[diagnostic(
        code(callcache::cache::io),
        help("Check file permissions and ensure the path exists")
    )]
    Io {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// Path that caused the error, if available
        path: Option<Box<Path>>,
        /// Operation that failed (e.g., "read", "write", "create")
        operation: String,
    },

    /// Configuration error
    #[error("Cache configuration error: {message}")]
    #[diagnostic(code(callcache::cache::config))]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Invalid arguments to a maintenance operation
    #[error("Validation error: {message}")]
    #[diagnostic(code(callcache::cache::validation))]
    Validation {
        /// Error message describing the validation issue
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(code(callcache::cache::serialization))]
    Serialization {
        /// Error message describing the serialization issue
        message: String,
    },

    /// A callable reference cannot be resolved
    #[error("Cannot resolve {reference:?}: {message}")]
    #[diagnostic(
        code(callcache::cache::resolution),
        help("Register the function with Registry::register_function under a stable 'module:qualname' identifier")
    )]
    Resolution {
        /// The offending reference
        reference: String,
        /// What went wrong
        message: String,
    },

    /// No encoder could turn a value into a tagged tree
    #[error("Cannot encode {type_name}: {message}")]
    #[diagnostic(code(callcache::cache::encode))]
    Encode {
        /// Kind of value that failed
        type_name: String,
        /// What went wrong
        message: String,
    },

    /// A stored tree cannot be turned back into a value
    #[error("Cannot decode cached result: {message}")]
    #[diagnostic(code(callcache::cache::decode))]
    Decode {
        /// What went wrong
        message: String,
    },

    /// Blob store failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Blob(#[from] callcache_cas::Error),

    /// A cleaning pass could not bring usage under the target size
    #[error("Unable to clean {}: final size {usage} exceeds maxsize {maxsize}", dir.display())]
    #[diagnostic(
        code(callcache::cache::eviction_shortfall),
        help("Increase maxsize, enable delete_unknown_files, or widen the tag filters")
    )]
    EvictionShortfall {
        /// Blob root that was cleaned
        dir: PathBuf,
        /// Usage after the pass, in bytes
        usage: u64,
        /// Requested bound, in bytes
        maxsize: u64,
    },

    /// Metadata store failure
    #[error("Metadata store error: {message}")]
    #[diagnostic(code(callcache::cache::store))]
    Store {
        /// What went wrong
        message: String,
    },

    /// The wrapped function itself failed
    #[error("{name} failed")]
    #[diagnostic(code(callcache::cache::callable))]
    Callable {
        /// Reference of the wrapped function
        name: String,
        /// Error returned by the function
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    /// Create a configuration error
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            message: msg.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

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

    /// Create a serialization error
    #[must_use]
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a resolution error
    #[must_use]
    pub fn resolution(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Resolution {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create an encode error
    #[must_use]
    pub fn encode(type_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Encode {
            type_name: type_name.into(),
            message: msg.into(),
        }
    }

    /// Create a decode error
    #[must_use]
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    /// Create a metadata store error
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
        }
    }

    /// Errors that are never swallowed by fallbacks
    ///
    /// Consistency violations, lock timeouts and eviction shortfalls mean a
    /// broken invariant or an unattainable target.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Blob(e) => e.is_fatal(),
            Self::EvictionShortfall { .. } => true,
            _ => false,
        }
    }

    /// Errors that turn a cache hit into a self-healing miss
    #[must_use]
    pub fn is_decode_failure(&self) -> bool {
        match self {
            Self::Blob(e) => !e.is_fatal(),
            Self::Decode { .. }
            | Self::Resolution { .. }
            | Self::Serialization { .. }
            | Self::Io { .. } => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_blob_errors_keep_their_classification() {
        let corrupt: Error = callcache_cas::Error::Missing {
            local_path: "/cache/a.nc".into(),
            href: "/cache/a.nc".into(),
        }
        .into();
        assert!(corrupt.is_decode_failure());
        assert!(!corrupt.is_fatal());

        let timeout: Error = callcache_cas::Error::LockTimeout {
            path: "/cache/a.nc".into(),
            lockfile: "/cache/a.nc.lock".into(),
            waited: Duration::from_secs(1),
        }
        .into();
        assert!(timeout.is_fatal());
        assert!(!timeout.is_decode_failure());
    }

    #[test]
    fn test_shortfall_is_fatal() {
        let err = Error::EvictionShortfall {
            dir: "/cache".into(),
            usage: 10,
            maxsize: 5,
        };
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Unable to clean /cache: final size 10 exceeds maxsize 5"
        );
    }

    #[test]
    fn test_store_errors_do_not_self_heal() {
        assert!(!Error::store("disk full").is_decode_failure());
        assert!(!Error::encode("Float", "NaN").is_decode_failure());
    }
}
