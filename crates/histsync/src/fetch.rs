//! Fetch stage: remote files → staging → retention merge → cache.

use crate::cache::{self, CacheError};
use crate::clock::Clock;
use crate::merge::{merge, MergeOutcome};
use crate::remote::{RemoteError, RemoteSource};
use crate::report::{duration_ms, ItemFailure};
use crate::sample::{TagName, TagNameError};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Stage-fatal fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    List(#[from] RemoteError),

    #[error("Failed to prepare directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Why a single file failed.
#[derive(Debug, Error)]
enum FetchItemError {
    #[error(transparent)]
    Tag(#[from] TagNameError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("incoming data rejected: {0}")]
    Incoming(#[source] CacheError),

    #[error("existing cache unreadable: {0}")]
    Existing(#[source] CacheError),

    #[error("cache update failed: {0}")]
    Write(#[source] CacheError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
    /// Leftover staging entries removed at the end of the stage.
    pub swept_staging: usize,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Duration,
}

/// Where the fetch stage reads from and writes to.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub remote_dir: String,
    pub staging_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub file_suffix: String,
    pub retention: chrono::Duration,
}

pub struct FetchStage<R> {
    source: R,
    settings: FetchSettings,
    clock: Arc<dyn Clock>,
}

impl<R: RemoteSource> FetchStage<R> {
    pub fn new(source: R, settings: FetchSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            source,
            settings,
            clock,
        }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Fetch and merge every data file in the remote directory.
    ///
    /// A failing file is recorded and skipped; only an unusable remote
    /// listing or local directory aborts the stage.
    pub fn fetch_all(&self) -> Result<FetchReport, FetchError> {
        let started = Instant::now();
        for dir in [&self.settings.staging_dir, &self.settings.cache_dir] {
            fs::create_dir_all(dir).map_err(|source| FetchError::Prepare {
                path: dir.clone(),
                source,
            })?;
        }

        let names = match self.source.list(&self.settings.remote_dir) {
            Ok(names) => names,
            Err(err) => {
                self.sweep_staging();
                return Err(err.into());
            }
        };

        let candidates: Vec<String> = names
            .into_iter()
            .filter(|name| {
                let wanted = name.ends_with(&self.settings.file_suffix);
                if !wanted {
                    debug!(file = %name, "Ignoring non-data remote file");
                }
                wanted
            })
            .collect();

        let mut report = FetchReport::default();
        if candidates.is_empty() {
            warn!(
                remote_dir = %self.settings.remote_dir,
                suffix = %self.settings.file_suffix,
                "No data files found in remote directory"
            );
        }

        let total = candidates.len();
        for (idx, name) in candidates.iter().enumerate() {
            report.attempted += 1;
            match self.fetch_one(name) {
                Ok(outcome) => {
                    report.succeeded += 1;
                    info!(
                        file = %name,
                        rows = outcome.samples.len(),
                        replaced = outcome.replaced,
                        expired = outcome.expired,
                        future = outcome.future,
                        progress = format_args!("{}/{}", idx + 1, total),
                        "Fetched and merged"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(file = %name, error = %err, "Failed to fetch file");
                    report.failures.push(ItemFailure::new(name.as_str(), &err));
                }
            }
        }

        report.swept_staging = self.sweep_staging();
        report.elapsed = started.elapsed();
        info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Fetch stage finished"
        );
        Ok(report)
    }

    fn fetch_one(&self, name: &str) -> Result<MergeOutcome, FetchItemError> {
        let tag = TagName::from_file_name(name, &self.settings.file_suffix)?;
        let staged = self
            .settings
            .staging_dir
            .join(staging_name(name));

        let result = self.stage_and_merge(&tag, name, &staged);

        if let Err(e) = fs::remove_file(&staged) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(file = %staged.display(), error = %e, "Failed to remove staging file");
            }
        }
        result
    }

    fn stage_and_merge(
        &self,
        tag: &TagName,
        name: &str,
        staged: &Path,
    ) -> Result<MergeOutcome, FetchItemError> {
        self.source
            .fetch(&self.settings.remote_dir, name, staged)?;
        let incoming = cache::read_samples(staged).map_err(FetchItemError::Incoming)?;

        let cache_path = self
            .settings
            .cache_dir
            .join(tag.file_name(&self.settings.file_suffix));
        let existing = match cache::read_samples(&cache_path) {
            Ok(rows) => rows,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) if e.is_corrupt() => {
                warn!(tag = %tag, error = %e, "Discarding corrupt cache file");
                Vec::new()
            }
            Err(e) => return Err(FetchItemError::Existing(e)),
        };

        let outcome = merge(
            tag,
            &incoming,
            &existing,
            self.settings.retention,
            self.clock.now(),
        );
        cache::write_samples_atomic(&cache_path, &outcome.samples)
            .map_err(FetchItemError::Write)?;
        Ok(outcome)
    }

    /// Remove leftover staged downloads. Entries not named like one are left
    /// alone.
    fn sweep_staging(&self) -> usize {
        let entries = match fs::read_dir(&self.settings.staging_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(
                    dir = %self.settings.staging_dir.display(),
                    error = %e,
                    "Failed to read staging directory"
                );
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file || !is_staging_name(&entry.file_name().to_string_lossy()) {
                debug!(file = %path.display(), "Leaving unrelated entry in staging directory");
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(file = %path.display(), error = %e, "Failed to sweep staging entry"),
            }
        }
        if removed > 0 {
            info!(removed, "Swept leftover staging files");
        }
        removed
    }
}

/// Staged downloads are named `<uuid simple>_<remote name>`.
fn staging_name(remote_name: &str) -> String {
    format!("{}_{}", Uuid::new_v4().simple(), remote_name)
}

fn is_staging_name(name: &str) -> bool {
    match name.split_once('_') {
        Some((id, rest)) => {
            !rest.is_empty() && id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}
