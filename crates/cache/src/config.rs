//! Cache settings
//!
//! [`Settings`] is a plain value passed explicitly to the engine, the
//! registry and the cleaner. There is no process-wide configuration.

use crate::registry::files::SUPPORTED_ARRAY_KINDS;
use crate::store::Expiration;
use crate::{Error, Result};
use callcache_cas::{BlobStore, LockSettings, LockTimeoutPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable overriding the blob root
pub const CACHE_DIR_ENV: &str = "CALLCACHE_CACHE_DIR";
/// Environment variable toggling the cache
pub const USE_CACHE_ENV: &str = "CALLCACHE_USE_CACHE";
/// Environment variable setting the default tag
pub const TAG_ENV: &str = "CALLCACHE_TAG";

/// Recognized cache options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serve and store results; when false every call runs directly
    pub use_cache: bool,
    /// Root directory of the blob store
    pub cache_files_dir: PathBuf,
    /// Read-only URL prefix used for asset hrefs
    pub cache_files_href_base: Option<String>,
    /// Options recorded next to blob-backed results for their readers
    pub storage_options: serde_json::Map<String, serde_json::Value>,
    /// Content kind used to store array results
    pub array_content_kind: String,
    /// Move returned files into the store instead of copying them
    pub io_delete_original: bool,
    /// Surface the first encoder failure instead of trying the next encoder
    pub raise_all_encoding_errors: bool,
    /// Expiration given to new entries, and required of looked-up entries
    pub expiration: Option<DateTime<Utc>>,
    /// Tag written on new entries and on hits
    pub tag: Option<String>,
    /// Maximum wait on a blob lock marker; `None` waits forever
    pub lock_timeout: Option<Duration>,
    /// Behaviour when `lock_timeout` elapses
    pub lock_timeout_policy: LockTimeoutPolicy,
    /// Age after which a lock marker is abandoned; `None` never expires
    pub lock_validity_period: Option<Duration>,
    /// Return the metadata entry instead of the decoded value
    pub return_cache_entry: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_files_dir: default_cache_files_dir(),
            cache_files_href_base: None,
            storage_options: serde_json::Map::new(),
            array_content_kind: SUPPORTED_ARRAY_KINDS[0].to_string(),
            io_delete_original: false,
            raise_all_encoding_errors: false,
            expiration: None,
            tag: None,
            lock_timeout: Some(Duration::from_secs(60)),
            lock_timeout_policy: LockTimeoutPolicy::Fail,
            lock_validity_period: None,
            return_cache_entry: false,
        }
    }
}

impl Settings {
    /// Default settings with the blob root at `dir`
    #[must_use]
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_files_dir: dir.into(),
            ..Self::default()
        }
    }

    /// Default settings overlaid with `CALLCACHE_*` environment variables
    ///
    /// Without `CALLCACHE_CACHE_DIR` the blob root is the first writable of
    /// `$XDG_CACHE_HOME/callcache/files`, the OS cache dir and the temp dir,
    /// created if needed.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`Settings::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Self {
            cache_files_dir: writable_cache_dir(CacheDirInputs::from_lookup(&lookup)),
            ..Self::default()
        };
        if let Some(raw) = lookup(USE_CACHE_ENV) {
            settings.use_cache = parse_bool(&raw).ok_or_else(|| {
                Error::configuration(format!("{USE_CACHE_ENV} must be a boolean, got {raw:?}"))
            })?;
        }
        if let Some(tag) = lookup(TAG_ENV) {
            settings.tag = Some(tag);
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Reject option combinations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.cache_files_dir.as_os_str().is_empty() {
            return Err(Error::configuration("cache_files_dir must not be empty"));
        }
        if self.tag.as_deref().is_some_and(str::is_empty) {
            return Err(Error::configuration("tag must not be empty"));
        }
        if self.lock_validity_period == Some(Duration::ZERO) {
            return Err(Error::configuration(
                "lock_validity_period must be positive",
            ));
        }
        if !SUPPORTED_ARRAY_KINDS.contains(&self.array_content_kind.as_str()) {
            return Err(Error::configuration(format!(
                "array_content_kind {:?} is not supported, expected one of {SUPPORTED_ARRAY_KINDS:?}",
                self.array_content_kind
            )));
        }
        Ok(())
    }

    /// Lock marker timing derived from these settings
    #[must_use]
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            timeout: self.lock_timeout,
            validity: self.lock_validity_period,
            policy: self.lock_timeout_policy,
            ..LockSettings::default()
        }
    }

    /// Blob store rooted at `cache_files_dir`
    #[must_use]
    pub fn blob_store(&self) -> BlobStore {
        BlobStore::new(&self.cache_files_dir)
            .with_href_base(self.cache_files_href_base.clone())
            .with_lock_settings(self.lock_settings())
    }

    /// Expiration of entries written under these settings
    #[must_use]
    pub fn entry_expiration(&self) -> Expiration {
        self.expiration.map_or(Expiration::Never, Expiration::At)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct CacheDirInputs {
    override_dir: Option<PathBuf>,
    xdg_cache_home: Option<PathBuf>,
    os_cache_dir: Option<PathBuf>,
    temp_dir: PathBuf,
}

impl CacheDirInputs {
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let path = |name: &str| {
            lookup(name)
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
        };
        Self {
            override_dir: path(CACHE_DIR_ENV),
            xdg_cache_home: path("XDG_CACHE_HOME"),
            os_cache_dir: dirs::cache_dir(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// Candidate roots in preference order, the temp fallback last
    ///
    /// An explicit override is the only candidate.
    fn candidates(self) -> Vec<PathBuf> {
        if let Some(dir) = self.override_dir {
            return vec![dir];
        }
        self.xdg_cache_home
            .into_iter()
            .chain(self.os_cache_dir)
            .chain(std::iter::once(self.temp_dir))
            .map(|base| base.join("callcache/files"))
            .collect()
    }
}

/// Preferred blob root, chosen without touching the filesystem
fn preferred_cache_dir(inputs: CacheDirInputs) -> PathBuf {
    first_or_temp(inputs.candidates())
}

/// First candidate root that exists and is writable, or can be created
///
/// An explicit override is taken as is, even if it does not exist yet.
fn writable_cache_dir(inputs: CacheDirInputs) -> PathBuf {
    if inputs.override_dir.is_some() {
        return preferred_cache_dir(inputs);
    }
    let candidates = inputs.candidates();
    for path in &candidates {
        if path.exists() {
            let marker = path.join(".write_check");
            if std::fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&marker)
                .is_ok()
            {
                let _ = std::fs::remove_file(&marker);
                return path.clone();
            }
            continue;
        }
        if std::fs::create_dir_all(path).is_ok() {
            return path.clone();
        }
    }
    // Nothing writable: keep the temp fallback and let writes report the error
    first_or_temp(candidates.into_iter().rev().collect())
}

fn first_or_temp(candidates: Vec<PathBuf>) -> PathBuf {
    candidates
        .into_iter()
        .next()
        .unwrap_or_else(|| std::env::temp_dir().join("callcache/files"))
}

fn default_cache_files_dir() -> PathBuf {
    preferred_cache_dir(CacheDirInputs::from_lookup(|name| std::env::var(name).ok()))
}
