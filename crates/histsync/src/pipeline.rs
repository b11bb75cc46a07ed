//! One run: lock → fetch → load → release.

use crate::clock::Clock;
use crate::config::{Config, ConfigError};
use crate::fetch::{FetchReport, FetchStage};
use crate::load::{ImportedTags, LoadReport, LoadStage};
use crate::lock::RunLock;
use crate::remote::{LocalDirSource, RemoteSource};
use crate::report::duration_ms;
use crate::store::{DuckDbConnector, StoreConnector};
use chrono::NaiveDateTime;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// The run finished but some files or tags failed.
    PartialFailure,
    /// A stage could not run at all, or the lock could not be managed.
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: NaiveDateTime,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Duration,
    pub status: RunStatus,
    /// `None` when the stage failed before producing a report.
    pub fetch: Option<FetchReport>,
    pub load: Option<LoadReport>,
    /// Stage-fatal and lock errors.
    pub errors: Vec<String>,
}

impl RunSummary {
    fn status_for(
        fetch: Option<&FetchReport>,
        load: Option<&LoadReport>,
        errors: &[String],
    ) -> RunStatus {
        if !errors.is_empty() || fetch.is_none() || load.is_none() {
            return RunStatus::Failed;
        }
        let item_failures = fetch.map_or(0, |f| f.failed) + load.map_or(0, |l| l.failed);
        if item_failures > 0 {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        }
    }

    /// Failed items over attempted items, across both stages.
    pub fn failure_counts(&self) -> (usize, usize) {
        let fetch = self.fetch.as_ref().map_or((0, 0), |f| (f.failed, f.attempted));
        let load = self
            .load
            .as_ref()
            .map_or((0, 0), |l| (l.failed, l.files_processed));
        (fetch.0 + load.0, fetch.1 + load.1)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Another run holds the lock; nothing was done.
    SkippedBusy,
}

/// Pipeline reading a mounted export directory and writing to DuckDB.
pub fn local_pipeline(
    config: &Config,
    clock: Arc<dyn Clock>,
) -> Result<Pipeline<LocalDirSource, DuckDbConnector>, ConfigError> {
    config.validate()?;
    let lock = RunLock::new(config.lock_path.clone(), config.stale_after(), clock.clone());
    let fetch = FetchStage::new(
        LocalDirSource::default(),
        config.fetch_settings()?,
        clock.clone(),
    );
    let load = LoadStage::new(
        DuckDbConnector::new(config.database.clone()),
        config.load_settings(),
    );
    Ok(Pipeline::new(lock, fetch, load, clock))
}

/// Sequences the stages under the run lock.
pub struct Pipeline<R, C> {
    lock: RunLock,
    fetch: FetchStage<R>,
    load: LoadStage<C>,
    clock: Arc<dyn Clock>,
}

impl<R: RemoteSource, C: StoreConnector> Pipeline<R, C> {
    pub fn new(
        lock: RunLock,
        fetch: FetchStage<R>,
        load: LoadStage<C>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            lock,
            fetch,
            load,
            clock,
        }
    }

    pub fn lock(&self) -> &RunLock {
        &self.lock
    }

    /// Run both stages once. Never returns an error: failures end up in the
    /// summary and the lock is always released.
    pub fn run_once(&self) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", run_id = %run_id);
        let _enter = span.enter();

        let started = Instant::now();
        let started_at = self.clock.now();
        let mut errors = Vec::new();

        let guard = match self.lock.try_acquire() {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                info!("Another run is in progress, skipping");
                return RunOutcome::SkippedBusy;
            }
            Err(err) => {
                error!(error = %err, "Could not acquire run lock");
                errors.push(err.to_string());
                return RunOutcome::Completed(RunSummary {
                    run_id,
                    started_at,
                    elapsed: started.elapsed(),
                    status: RunStatus::Failed,
                    fetch: None,
                    load: None,
                    errors,
                });
            }
        };
        info!(started_at = %started_at, "Run started");

        let fetch = match self.fetch.fetch_all() {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "Fetch stage failed");
                errors.push(format!("fetch: {}", err));
                None
            }
        };

        let mut imported = ImportedTags::new();
        let load = match self.load.load_all(&mut imported) {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "Load stage failed");
                errors.push(format!("load: {}", err));
                None
            }
        };

        if let Err(err) = guard.release() {
            error!(error = %err, "Could not release run lock");
            errors.push(err.to_string());
        }

        let status = RunSummary::status_for(fetch.as_ref(), load.as_ref(), &errors);
        let summary = RunSummary {
            run_id,
            started_at,
            elapsed: started.elapsed(),
            status,
            fetch,
            load,
            errors,
        };

        let (failed, attempted) = summary.failure_counts();
        match status {
            RunStatus::Success => info!(
                elapsed_ms = summary.elapsed.as_millis() as u64,
                attempted,
                "Run completed"
            ),
            RunStatus::PartialFailure => warn!(
                elapsed_ms = summary.elapsed.as_millis() as u64,
                failed,
                attempted,
                "Run completed with failures"
            ),
            RunStatus::Failed => error!(
                elapsed_ms = summary.elapsed.as_millis() as u64,
                errors = summary.errors.len(),
                "Run failed"
            ),
        }

        RunOutcome::Completed(summary)
    }
}
