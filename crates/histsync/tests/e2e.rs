//! End-to-end tests for histsync runs.
//!
//! Each test gets its own home directory, export directory, and DuckDB file.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use histsync::cache::read_samples;
use histsync::{
    local_pipeline, Clock, Config, DuckDbConnector, DuckDbStore, FetchStage, LoadStage,
    LocalDirSource, ManualClock, Pipeline, RemoteError, RemoteSource, RunLock, RunOutcome,
    RunStatus, RunSummary, Sample, StoreConnector, StoreError, TagName, TagStore,
};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

/// Create a test environment with temp directories
struct TestEnv {
    /// Temp directory (cleaned up on drop)
    _temp: TempDir,
    /// Historian export directory
    pub remote_dir: PathBuf,
    pub config: Config,
    pub clock: Arc<ManualClock>,
}

impl TestEnv {
    fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let remote_dir = temp.path().join("export");
        fs::create_dir_all(&remote_dir).expect("Failed to create export dir");

        let mut config = Config::for_home(&temp.path().join("home"));
        config.remote_dir = Some(remote_dir.to_string_lossy().into_owned());

        Self {
            _temp: temp,
            remote_dir,
            config,
            clock: Arc::new(ManualClock::new(at(6, 2, 0))),
        }
    }

    fn write_remote(&self, name: &str, content: &str) {
        fs::write(self.remote_dir.join(name), content).expect("Failed to write export file");
    }

    fn cache_file(&self, tag: &str) -> PathBuf {
        self.config.cache_dir.join(format!("{}.csv", tag))
    }

    fn pipeline(&self) -> Pipeline<LocalDirSource, DuckDbConnector> {
        local_pipeline(&self.config, self.clock.clone()).expect("valid config")
    }

    fn pipeline_with<R: RemoteSource, C: StoreConnector>(
        &self,
        source: R,
        connector: C,
    ) -> Pipeline<R, C> {
        let clock: Arc<dyn Clock> = self.clock.clone();
        Pipeline::new(
            RunLock::new(
                self.config.lock_path.clone(),
                self.config.stale_after(),
                clock.clone(),
            ),
            FetchStage::new(source, self.config.fetch_settings().unwrap(), clock.clone()),
            LoadStage::new(connector, self.config.load_settings()),
            clock,
        )
    }

    /// Open the database for inspection. Drop it before the next run.
    fn store(&self) -> DuckDbStore {
        DuckDbStore::open(&self.config.database).expect("Failed to open store")
    }
}

fn completed(outcome: RunOutcome) -> RunSummary {
    match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::SkippedBusy => panic!("run was unexpectedly skipped"),
    }
}

fn tag(name: &str) -> TagName {
    TagName::new(name).unwrap()
}

/// Fails every fetch of one file name with a network error.
struct FlakySource {
    inner: LocalDirSource,
    broken: &'static str,
}

impl RemoteSource for FlakySource {
    fn list(&self, dir: &str) -> Result<Vec<String>, RemoteError> {
        self.inner.list(dir)
    }

    fn fetch(&self, dir: &str, name: &str, dest: &Path) -> Result<(), RemoteError> {
        if name == self.broken {
            // Leave a partial download behind, like a dropped transfer would.
            fs::write(dest, "timestamp,va").ok();
            return Err(RemoteError::Fetch {
                dir: dir.to_string(),
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
            });
        }
        self.inner.fetch(dir, name, dest)
    }
}

struct UnreachableStore;

impl StoreConnector for UnreachableStore {
    type Store = DuckDbStore;

    fn connect(&self) -> Result<DuckDbStore, StoreError> {
        Err(StoreError::Query(histsync_db::BackendError::NotAvailable(
            "historian database offline".to_string(),
        )))
    }
}

// ============================================================================
// Full runs
// ============================================================================

#[test]
fn test_run_fetches_and_loads_all_tags() {
    let env = TestEnv::new();
    env.write_remote(
        "FIC101.csv",
        "timestamp,value\n2024-01-05 09:00:00,1.5\n2024-01-05 10:00:00,2.5\n",
    );
    env.write_remote("TIC200.csv", "timestamp,value\n2024-01-05 09:30:00,80\n");
    env.write_remote("notes.txt", "not a data file");

    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.status, RunStatus::Success);
    let fetch = summary.fetch.as_ref().unwrap();
    assert_eq!((fetch.attempted, fetch.succeeded, fetch.failed), (2, 2, 0));
    let load = summary.load.as_ref().unwrap();
    assert_eq!(load.files_processed, 2);
    assert_eq!(load.rows_inserted, 3);
    assert!(summary.errors.is_empty());
    assert!(!env.config.lock_path.exists());

    let store = env.store();
    assert_eq!(
        store.samples(&tag("FIC101")).unwrap(),
        vec![
            Sample::new(at(5, 9, 0), 1.5),
            Sample::new(at(5, 10, 0), 2.5)
        ]
    );
    assert_eq!(
        store.latest_timestamp(&tag("TIC200")).unwrap(),
        Some(at(5, 9, 30))
    );
}

#[test]
fn test_second_run_without_new_data_inserts_nothing() {
    let env = TestEnv::new();
    env.write_remote(
        "FIC101.csv",
        "timestamp,value\n2024-01-05 09:00:00,1\n2024-01-05 10:00:00,2\n",
    );

    let first = completed(env.pipeline().run_once());
    env.clock.advance(Duration::hours(1));
    let second = completed(env.pipeline().run_once());

    assert_eq!(first.load.unwrap().rows_inserted, 2);
    let second_load = second.load.unwrap();
    assert_eq!(second_load.rows_inserted, 0);
    assert_eq!(second_load.succeeded, 1);
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(env.store().row_count(&tag("FIC101")).unwrap(), 2);
}

#[test]
fn test_new_remote_rows_are_loaded_incrementally() {
    let env = TestEnv::new();
    env.write_remote(
        "FIC101.csv",
        "timestamp,value\n2024-01-05 09:00:00,1\n2024-01-05 10:00:00,2\n",
    );
    completed(env.pipeline().run_once());

    // Next export overlaps the previous one and revises 10:00.
    env.write_remote(
        "FIC101.csv",
        "timestamp,value\n2024-01-05 10:00:00,20\n2024-01-05 11:00:00,3\n",
    );
    env.clock.advance(Duration::hours(1));
    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.load.unwrap().rows_inserted, 1);
    let cached = read_samples(&env.cache_file("FIC101")).unwrap();
    assert_eq!(
        cached,
        vec![
            Sample::new(at(5, 9, 0), 1.0),
            Sample::new(at(5, 10, 0), 20.0),
            Sample::new(at(5, 11, 0), 3.0),
        ]
    );
    assert_eq!(env.store().row_count(&tag("FIC101")).unwrap(), 3);
}

// ============================================================================
// Watermark filtering
// ============================================================================

#[test]
fn test_load_resumes_after_store_watermark() {
    let env = TestEnv::new();
    {
        let store = env.store();
        store
            .insert_batch(&tag("T1"), &[Sample::new(at(5, 9, 0), 0.0)])
            .unwrap();
    }
    fs::create_dir_all(&env.config.cache_dir).unwrap();
    fs::write(
        env.cache_file("T1"),
        "timestamp,value\n\
         2024-01-05 08:00:00,1\n\
         2024-01-05 09:00:00,2\n\
         2024-01-05 09:30:00,3\n\
         2024-01-05 10:00:00,4\n",
    )
    .unwrap();

    let first = completed(env.pipeline().run_once());
    let second = completed(env.pipeline().run_once());

    let load = first.load.unwrap();
    assert_eq!(load.rows_inserted, 2);
    assert_eq!(load.per_tag[0].tag, tag("T1"));
    assert_eq!(second.load.unwrap().rows_inserted, 0);

    let stored: Vec<NaiveDateTime> = env
        .store()
        .samples(&tag("T1"))
        .unwrap()
        .into_iter()
        .map(|s| s.timestamp)
        .collect();
    assert_eq!(stored, vec![at(5, 9, 0), at(5, 9, 30), at(5, 10, 0)]);
}

#[test]
fn test_rows_past_retention_are_not_cached_or_loaded() {
    let env = TestEnv::new();
    env.write_remote(
        "T1.csv",
        "timestamp,value\n2023-12-20 12:00:00,1\n2024-01-05 12:00:00,2\n",
    );

    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.load.unwrap().rows_inserted, 1);
    let cached = read_samples(&env.cache_file("T1")).unwrap();
    assert_eq!(cached, vec![Sample::new(at(5, 12, 0), 2.0)]);
}

// ============================================================================
// Partial failures
// ============================================================================

#[test]
fn test_malformed_file_does_not_block_others() {
    let env = TestEnv::new();
    env.write_remote("A.csv", "timestamp,value\n2024-01-05 09:00:00,1\n");
    env.write_remote("B.csv", "timestamp,value\n2024-01-05 09:00:00,not-a-number\n");
    env.write_remote("C.csv", "timestamp,value\n2024-01-05 09:00:00,3\n");

    let summary = completed(env.pipeline().run_once());

    let fetch = summary.fetch.as_ref().unwrap();
    assert_eq!((fetch.attempted, fetch.succeeded, fetch.failed), (3, 2, 1));
    assert_eq!(fetch.failures[0].item, "B.csv");
    assert!(env.cache_file("A").exists());
    assert!(!env.cache_file("B").exists());
    assert!(env.cache_file("C").exists());
    assert_eq!(summary.status, RunStatus::PartialFailure);
    assert_eq!(summary.load.unwrap().rows_inserted, 2);
}

#[test]
fn test_network_failure_on_one_file_still_loads_the_other() {
    let env = TestEnv::new();
    env.write_remote("A.csv", "timestamp,value\n2024-01-05 09:00:00,1\n");
    env.write_remote("B.csv", "timestamp,value\n2024-01-05 09:00:00,2\n");

    let pipeline = env.pipeline_with(
        FlakySource {
            inner: LocalDirSource::default(),
            broken: "B.csv",
        },
        DuckDbConnector::new(env.config.database.clone()),
    );
    let summary = completed(pipeline.run_once());

    let fetch = summary.fetch.as_ref().unwrap();
    assert_eq!((fetch.succeeded, fetch.failed), (1, 1));
    assert!(fetch.failures[0].reason.contains("connection reset"));
    let load = summary.load.as_ref().unwrap();
    assert_eq!(load.files_processed, 1);
    assert_eq!(load.per_tag[0].tag, tag("A"));
    assert_eq!(summary.status, RunStatus::PartialFailure);

    // The partial download was removed with the rest of staging.
    assert_eq!(fs::read_dir(&env.config.staging_dir).unwrap().count(), 0);
    drop(pipeline);
    assert_eq!(env.store().row_count(&tag("A")).unwrap(), 1);
}

#[test]
fn test_unreachable_store_fails_run_but_fetch_completes() {
    let env = TestEnv::new();
    env.write_remote("A.csv", "timestamp,value\n2024-01-05 09:00:00,1\n");

    let pipeline = env.pipeline_with(LocalDirSource::default(), UnreachableStore);
    let summary = completed(pipeline.run_once());

    assert_eq!(summary.status, RunStatus::Failed);
    assert_eq!(summary.fetch.as_ref().unwrap().succeeded, 1);
    assert!(summary.load.is_none());
    assert!(summary.errors[0].starts_with("load:"));
    assert!(env.cache_file("A").exists());
    assert!(!env.config.lock_path.exists());
}

#[test]
fn test_missing_export_directory_fails_fetch_but_still_loads() {
    let env = TestEnv::new();
    fs::create_dir_all(&env.config.cache_dir).unwrap();
    fs::write(env.cache_file("A"), "timestamp,value\n2024-01-05 09:00:00,1\n").unwrap();
    fs::remove_dir_all(&env.remote_dir).unwrap();

    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.status, RunStatus::Failed);
    assert!(summary.fetch.is_none());
    assert!(summary.errors[0].starts_with("fetch:"));
    assert_eq!(summary.load.unwrap().rows_inserted, 1);
    assert!(!env.config.lock_path.exists());
}

#[test]
fn test_staging_dir_shared_with_cache_is_rejected() {
    let mut env = TestEnv::new();
    env.config.staging_dir = env.config.cache_dir.clone();
    env.write_remote("A.csv", "timestamp,value\n2024-01-05 09:00:00,1\n");

    assert!(local_pipeline(&env.config, env.clock.clone()).is_err());
    assert!(!env.cache_file("A").exists());
}

// ============================================================================
// Run lock
// ============================================================================

#[test]
fn test_run_is_skipped_while_lock_is_fresh() {
    let env = TestEnv::new();
    env.write_remote("A.csv", "timestamp,value\n2024-01-05 09:00:00,1\n");
    let lock = RunLock::new(
        env.config.lock_path.clone(),
        env.config.stale_after(),
        env.clock.clone(),
    );
    let guard = lock.try_acquire().unwrap().expect("lock should be free");

    env.clock.advance(Duration::minutes(10));
    assert!(matches!(env.pipeline().run_once(), RunOutcome::SkippedBusy));
    assert!(!env.cache_file("A").exists());

    // The holder crashed: the record stays until it goes stale.
    std::mem::forget(guard);
    env.clock.advance(Duration::minutes(20));
    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.status, RunStatus::Success);
    assert!(env.cache_file("A").exists());
    assert!(!env.config.lock_path.exists());
}

#[test]
fn test_corrupt_lock_record_is_cleared() {
    let env = TestEnv::new();
    fs::create_dir_all(env.config.lock_path.parent().unwrap()).unwrap();
    fs::write(&env.config.lock_path, "\u{0}\u{0}garbage").unwrap();

    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.status, RunStatus::Success);
    assert!(!env.config.lock_path.exists());
}

#[test]
fn test_leftover_staging_files_are_swept() {
    let env = TestEnv::new();
    fs::create_dir_all(&env.config.staging_dir).unwrap();
    fs::write(
        env.config.staging_dir.join("9b1e0c7a44d24f0e8f5a2b6c3d7e1f20_A.csv"),
        "timestamp,val",
    )
    .unwrap();

    let summary = completed(env.pipeline().run_once());

    assert_eq!(summary.fetch.unwrap().swept_staging, 1);
    assert_eq!(fs::read_dir(&env.config.staging_dir).unwrap().count(), 0);
}
