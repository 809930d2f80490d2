//! Lock markers coordinating blob writers and readers
//!
//! A marker is a sibling file named `<blob>.lock`, created atomically while a
//! blob is being produced. Markers carry no content; their modification time
//! is what makes them expire.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Suffix appended to a blob path to name its lock marker
pub const LOCK_SUFFIX: &str = ".lock";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to do when a lock marker outlives the wait timeout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockTimeoutPolicy {
    /// Fail with [`Error::LockTimeout`]
    #[default]
    Fail,
    /// Warn and continue as if the marker were absent
    Proceed,
}

/// Timing knobs shared by every lock marker of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Maximum wait for a marker to disappear; `None` waits forever
    pub timeout: Option<Duration>,
    /// Age after which a marker is considered abandoned; `None` never expires
    pub validity: Option<Duration>,
    /// Behaviour once `timeout` elapsed
    pub policy: LockTimeoutPolicy,
    /// Delay between two existence checks
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            validity: None,
            policy: LockTimeoutPolicy::Fail,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Path of the lock marker guarding `target`
#[must_use]
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name: OsString = target.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// If `path` is a lock marker, the path of the blob it guards
#[must_use]
pub fn locked_target(path: &Path) -> Option<PathBuf> {
    let s = path.to_str()?;
    s.strip_suffix(LOCK_SUFFIX)
        .filter(|t| !t.is_empty())
        .map(PathBuf::from)
}

/// Whether the marker at `lockfile` is older than `validity`
///
/// A `None` validity means markers never expire. A marker that vanished in
/// the meantime is reported as expired.
pub fn is_marker_expired(lockfile: &Path, validity: Option<Duration>) -> Result<bool> {
    let Some(validity) = validity else {
        return Ok(false);
    };
    let modified = match fs::metadata(lockfile).and_then(|m| m.modified()) {
        Ok(modified) => modified,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(Error::io(e, lockfile, "metadata")),
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age > validity)
}

/// A lock marker for one blob
#[derive(Debug, Clone)]
pub struct FileLock {
    target: PathBuf,
    lockfile: PathBuf,
    settings: LockSettings,
}

/// Removes the marker when dropped
#[derive(Debug)]
pub struct LockGuard {
    lockfile: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.lockfile) {
            Ok(()) => debug!(lockfile = %self.lockfile.display(), "Released lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                lockfile = %self.lockfile.display(),
                "Failed to release lock marker: {e}"
            ),
        }
    }
}

impl FileLock {
    /// Create the lock handle for `target`
    #[must_use]
    pub fn new(target: impl Into<PathBuf>, settings: LockSettings) -> Self {
        let target = target.into();
        let lockfile = lock_path(&target);
        Self {
            target,
            lockfile,
            settings,
        }
    }

    /// Path of the marker file
    #[must_use]
    pub fn lockfile(&self) -> &Path {
        &self.lockfile
    }

    /// Whether a marker currently exists
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lockfile.exists()
    }

    /// Whether the current marker is older than the validity period
    pub fn is_expired(&self) -> Result<bool> {
        is_marker_expired(&self.lockfile, self.settings.validity)
    }

    /// Create the marker if nobody holds it
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.lockfile.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lockfile)
        {
            Ok(_) => {
                debug!(lockfile = %self.lockfile.display(), "Acquired lock");
                Ok(Some(LockGuard {
                    lockfile: self.lockfile.clone(),
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(Error::io(e, &self.lockfile, "create_lock")),
        }
    }

    /// Block until the marker disappears, is reclaimed, or the timeout elapses
    ///
    /// Returns `Ok(true)` once the blob is free, `Ok(false)` when the timeout
    /// elapsed under [`LockTimeoutPolicy::Proceed`].
    pub fn wait_until_released(&self) -> Result<bool> {
        let start = Instant::now();
        let mut warned = false;
        while self.is_locked() {
            if self.is_expired()? {
                warn!(
                    lockfile = %self.lockfile.display(),
                    "Reclaiming abandoned lock marker"
                );
                match fs::remove_file(&self.lockfile) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::io(e, &self.lockfile, "remove_lock")),
                }
                break;
            }
            let waited = start.elapsed();
            if let Some(timeout) = self.settings.timeout
                && waited > timeout
            {
                return match self.settings.policy {
                    LockTimeoutPolicy::Fail => Err(Error::LockTimeout {
                        path: self.target.clone(),
                        lockfile: self.lockfile.clone(),
                        waited,
                    }),
                    LockTimeoutPolicy::Proceed => {
                        warn!(
                            path = %self.target.display(),
                            lockfile = %self.lockfile.display(),
                            "Lock wait timed out, proceeding without it"
                        );
                        Ok(false)
                    }
                };
            }
            if !warned {
                warn!(
                    path = %self.target.display(),
                    lockfile = %self.lockfile.display(),
                    "Blob is locked, waiting"
                );
                warned = true;
            }
            let pause = self
                .settings
                .timeout
                .map_or(self.settings.poll_interval, |t| {
                    t.min(self.settings.poll_interval)
                });
            std::thread::sleep(pause.max(Duration::from_millis(1)));
        }
        Ok(true)
    }

    /// Wait for the marker to be free, then take it
    ///
    /// `Ok(None)` means the wait timed out under [`LockTimeoutPolicy::Proceed`]
    /// and the caller continues without holding the marker.
    pub fn acquire(&self) -> Result<Option<LockGuard>> {
        loop {
            if let Some(guard) = self.try_acquire()? {
                return Ok(Some(guard));
            }
            if !self.wait_until_released()? {
                return Ok(None);
            }
        }
    }
}
