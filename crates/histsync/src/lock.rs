//! File-based run lock with time-based staleness.
//!
//! The lock record is a single text file holding the acquisition time. Its
//! age is the only liveness signal: a run that crashes without cleaning up
//! blocks new runs until the record goes stale.
//!
//! Reading, clearing, and creating the record happen while holding an OS
//! file lock (`fs2`) on a sidecar `<record>.guard` file, so two processes
//! that both see a stale record cannot both take it over. The sidecar is
//! never removed.

use crate::clock::Clock;
use chrono::{Duration, NaiveDateTime};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Layout of the timestamp written into the lock record.
pub const LOCK_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Accepts records with or without fractional seconds.
const LOCK_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Default staleness threshold.
pub const DEFAULT_STALE_AFTER_MINUTES: i64 = 30;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to read lock record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to remove lock record {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to create lock record {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to lock {path}: {source}")]
    Exclusive {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What the lock record currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Held {
        acquired_at: NaiveDateTime,
        age: Duration,
    },
    Stale {
        acquired_at: NaiveDateTime,
        age: Duration,
    },
    /// Unparsable, or dated implausibly far in the future.
    Corrupt { content: String },
}

impl LockState {
    pub fn is_held(&self) -> bool {
        matches!(self, LockState::Held { .. })
    }
}

/// Cross-run mutual exclusion over a single lock file.
pub struct RunLock {
    path: PathBuf,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("path", &self.path)
            .field("stale_after", &self.stale_after)
            .finish()
    }
}

impl RunLock {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            stale_after,
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Read and classify the lock record without changing it.
    pub fn inspect(&self) -> Result<LockState, LockError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LockState::Unlocked),
            Err(source) => {
                return Err(LockError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let Ok(acquired_at) = NaiveDateTime::parse_from_str(content.trim(), LOCK_PARSE_FORMAT)
        else {
            return Ok(LockState::Corrupt { content });
        };

        let age = self.clock.now() - acquired_at;
        if age < -self.stale_after {
            return Ok(LockState::Corrupt { content });
        }
        if age >= self.stale_after {
            Ok(LockState::Stale { acquired_at, age })
        } else {
            Ok(LockState::Held { acquired_at, age })
        }
    }

    /// Take the lock unless a fresh record exists.
    ///
    /// Returns `Ok(None)` when another run holds the lock. Stale and corrupt
    /// records are removed first.
    pub fn try_acquire(&self) -> Result<Option<RunLockGuard>, LockError> {
        let _section = exclusive_section(&self.path)?;

        match self.inspect()? {
            LockState::Held { acquired_at, age } => {
                info!(
                    lock = %self.path.display(),
                    acquired_at = %acquired_at,
                    age_secs = age.num_seconds(),
                    "Run lock is held by another run"
                );
                return Ok(None);
            }
            LockState::Stale { acquired_at, age } => {
                warn!(
                    lock = %self.path.display(),
                    acquired_at = %acquired_at,
                    age_secs = age.num_seconds(),
                    "Removing stale run lock"
                );
                remove_record(&self.path)?;
            }
            LockState::Corrupt { content } => {
                warn!(
                    lock = %self.path.display(),
                    content = %content.trim(),
                    "Removing corrupt run lock"
                );
                remove_record(&self.path)?;
            }
            LockState::Unlocked => {}
        }

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                info!(lock = %self.path.display(), "Run lock taken concurrently");
                return Ok(None);
            }
            Err(source) => {
                return Err(LockError::Create {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let now = self.clock.now();
        let record = now.format(LOCK_TIMESTAMP_FORMAT).to_string();
        if let Err(source) = file
            .write_all(record.as_bytes())
            .and_then(|()| file.sync_all())
        {
            drop(file);
            let _ = fs::remove_file(&self.path);
            return Err(LockError::Create {
                path: self.path.clone(),
                source,
            });
        }

        debug!(lock = %self.path.display(), acquired_at = %record, "Acquired run lock");
        Ok(Some(RunLockGuard {
            path: self.path.clone(),
            record,
            released: false,
        }))
    }

    /// Remove the lock record. A missing record is not an error.
    pub fn release(&self) -> Result<(), LockError> {
        let _section = exclusive_section(&self.path)?;
        remove_record(&self.path)
    }
}

/// Holds the run lock; the record is removed on drop.
///
/// Only the record this guard wrote is removed. If a later run took the lock
/// over after it went stale, that run's record stays.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    record: String,
    released: bool,
}

impl RunLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the record now and surface any error.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.remove_own_record()
    }

    fn remove_own_record(&self) -> Result<(), LockError> {
        let _section = exclusive_section(&self.path)?;
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim() == self.record => remove_record(&self.path),
            Ok(content) => {
                warn!(
                    lock = %self.path.display(),
                    content = %content.trim(),
                    "Run lock was taken over by another run, leaving it in place"
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        debug!(lock = %self.path.display(), "Releasing run lock");
        if let Err(e) = self.remove_own_record() {
            warn!("{}", e);
        }
    }
}

/// Sidecar file whose OS lock serializes record changes.
fn guard_path_for(record: &Path) -> PathBuf {
    let mut name = record
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".guard");
    record.with_file_name(name)
}

/// Block until this process holds the sidecar lock. Dropping the file
/// unlocks it.
fn exclusive_section(record: &Path) -> Result<File, LockError> {
    if let Some(parent) = record.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| LockError::Create {
            path: record.to_path_buf(),
            source,
        })?;
    }
    let path = guard_path_for(record);
    let exclusive_err = |source: io::Error| LockError::Exclusive {
        path: path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)
        .map_err(exclusive_err)?;
    file.lock_exclusive().map_err(exclusive_err)?;
    Ok(file)
}

fn remove_record(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LockError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
