//! Load stage: cache files → watermark filter → durable store.

use crate::cache::{self, CacheError};
use crate::report::{duration_ms, rate_per_sec, ItemFailure};
use crate::sample::{Sample, TagName};
use crate::store::{is_after_watermark, StoreConnector, StoreError, TagStore};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Default rows per committed batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Stage-fatal load failures.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read cache directory {path}: {source}")]
    CacheDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Durable store unavailable: {0}")]
    Connect(#[source] StoreError),
}

#[derive(Debug, Error)]
enum TagLoadError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tags loaded during the current run. Dropped when the run ends.
#[derive(Debug, Clone, Default)]
pub struct ImportedTags {
    tags: BTreeSet<TagName>,
}

impl ImportedTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, tag: &TagName) -> bool {
        self.tags.contains(tag)
    }

    /// Returns false if the tag was already present.
    pub fn insert(&mut self, tag: TagName) -> bool {
        self.tags.insert(tag)
    }
}

/// Outcome for one tag that was attempted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagLoad {
    pub tag: TagName,
    /// Rows committed, including those from batches before a failure.
    pub rows_inserted: u64,
    /// False when a read, watermark, or batch failure stopped the tag.
    pub completed: bool,
    #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
    pub duration: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadReport {
    pub files_processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Files whose tag was already loaded earlier in this run.
    pub skipped: usize,
    pub rows_inserted: u64,
    pub per_tag: Vec<TagLoad>,
    pub failures: Vec<ItemFailure>,
    #[serde(rename = "elapsed_ms", serialize_with = "duration_ms")]
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub cache_dir: PathBuf,
    pub file_suffix: String,
    pub batch_size: usize,
}

pub struct LoadStage<C> {
    connector: C,
    settings: LoadSettings,
}

impl<C: StoreConnector> LoadStage<C> {
    pub fn new(connector: C, settings: LoadSettings) -> Self {
        Self {
            connector,
            settings,
        }
    }

    pub fn settings(&self) -> &LoadSettings {
        &self.settings
    }

    /// Load every cache file's rows newer than its tag's watermark.
    ///
    /// Tags in `imported` are skipped; tags loaded successfully are added.
    pub fn load_all(&self, imported: &mut ImportedTags) -> Result<LoadReport, LoadError> {
        let started = Instant::now();
        let cache_dir = &self.settings.cache_dir;

        let files = match cache::list_cache_files(cache_dir, &self.settings.file_suffix) {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(dir = %cache_dir.display(), "Cache directory does not exist yet");
                Vec::new()
            }
            Err(source) => {
                return Err(LoadError::CacheDir {
                    path: cache_dir.clone(),
                    source,
                })
            }
        };

        let store = self.connector.connect().map_err(LoadError::Connect)?;

        let mut report = LoadReport::default();
        if files.is_empty() {
            info!("No cache files to load");
        }

        let total = files.len();
        for (idx, path) in files.iter().enumerate() {
            report.files_processed += 1;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let tag = match TagName::from_file_name(&name, &self.settings.file_suffix) {
                Ok(tag) => tag,
                Err(err) => {
                    report.failed += 1;
                    warn!(file = %name, error = %err, "Skipping cache file with malformed name");
                    report.failures.push(ItemFailure::new(name, err));
                    continue;
                }
            };

            if imported.contains(&tag) {
                report.skipped += 1;
                info!(tag = %tag, "Tag already imported in this run, skipping");
                continue;
            }

            let tag_started = Instant::now();
            let (rows, result) = self.load_tag(&store, &tag, path);
            let duration = tag_started.elapsed();
            report.rows_inserted += rows;
            let completed = result.is_ok();

            match result {
                Ok(()) => {
                    report.succeeded += 1;
                    imported.insert(tag.clone());
                }
                Err(err) => {
                    report.failed += 1;
                    warn!(tag = %tag, rows_committed = rows, error = %err, "Tag load failed");
                    report.failures.push(ItemFailure::new(tag.as_str(), &err));
                }
            }
            report.per_tag.push(TagLoad {
                tag,
                rows_inserted: rows,
                completed,
                duration,
            });

            info!(
                progress = format_args!("{}/{}", idx + 1, total),
                elapsed_secs = started.elapsed().as_secs_f64(),
                "Load progress"
            );
        }

        report.elapsed = started.elapsed();
        info!(
            files = report.files_processed,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            rows = report.rows_inserted,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Load stage finished"
        );
        Ok(report)
    }

    /// Returns rows committed for the tag alongside the outcome.
    fn load_tag<S: TagStore>(
        &self,
        store: &S,
        tag: &TagName,
        path: &Path,
    ) -> (u64, Result<(), TagLoadError>) {
        let samples = match cache::read_samples(path) {
            Ok(samples) => samples,
            Err(e) => return (0, Err(e.into())),
        };
        let watermark = match store.latest_timestamp(tag) {
            Ok(watermark) => watermark,
            Err(e) => return (0, Err(e.into())),
        };

        let mut pending: Vec<Sample> = samples
            .into_iter()
            .filter(|s| is_after_watermark(s.timestamp, watermark))
            .collect();
        if pending.is_empty() {
            info!(tag = %tag, watermark = ?watermark, "No new data found");
            return (0, Ok(()));
        }
        pending.sort_by_key(|s| s.timestamp);

        let total = pending.len() as u64;
        let started = Instant::now();
        let mut inserted = 0u64;
        for batch in pending.chunks(self.settings.batch_size.max(1)) {
            match store.insert_batch(tag, batch) {
                Ok(n) => inserted += n,
                Err(e) => return (inserted, Err(e.into())),
            }
            info!(
                tag = %tag,
                rows = inserted,
                total,
                rows_per_sec = rate_per_sec(inserted, started.elapsed()),
                "Committed batch"
            );
        }

        info!(
            tag = %tag,
            rows = inserted,
            rows_per_sec = rate_per_sec(inserted, started.elapsed()),
            "Imported tag"
        );
        (inserted, Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Watermark;
    use chrono::{NaiveDate, NaiveDateTime};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    /// In-memory store that can be told to fail a tag's Nth batch.
    #[derive(Default)]
    struct MemoryStore {
        rows: RefCell<BTreeMap<String, Vec<Sample>>>,
        batches: RefCell<BTreeMap<String, usize>>,
        fail_batch: Option<(String, usize)>,
    }

    impl TagStore for &MemoryStore {
        fn latest_timestamp(&self, tag: &TagName) -> Result<Watermark, StoreError> {
            Ok(self
                .rows
                .borrow()
                .get(tag.as_str())
                .and_then(|rows| rows.iter().map(|s| s.timestamp).max()))
        }

        fn insert_batch(&self, tag: &TagName, rows: &[Sample]) -> Result<u64, StoreError> {
            let mut batches = self.batches.borrow_mut();
            let n = batches.entry(tag.to_string()).or_default();
            *n += 1;
            if self.fail_batch.as_ref() == Some(&(tag.to_string(), *n)) {
                return Err(StoreError::Insert {
                    tag: tag.to_string(),
                    source: histsync_db::BackendError::Query("disk full".to_string()),
                });
            }
            self.rows
                .borrow_mut()
                .entry(tag.to_string())
                .or_default()
                .extend_from_slice(rows);
            Ok(rows.len() as u64)
        }
    }

    struct Shared<'a>(&'a MemoryStore);

    impl<'a> StoreConnector for Shared<'a> {
        type Store = &'a MemoryStore;

        fn connect(&self) -> Result<Self::Store, StoreError> {
            Ok(self.0)
        }
    }

    fn write_cache(dir: &Path, name: &str, rows: &[(NaiveDateTime, f64)]) {
        let samples: Vec<Sample> = rows.iter().map(|(t, v)| Sample::new(*t, *v)).collect();
        cache::write_samples_atomic(&dir.join(name), &samples).unwrap();
    }

    fn stage<'a>(store: &'a MemoryStore, dir: &Path, batch_size: usize) -> LoadStage<Shared<'a>> {
        LoadStage::new(
            Shared(store),
            LoadSettings {
                cache_dir: dir.to_path_buf(),
                file_suffix: ".csv".to_string(),
                batch_size,
            },
        )
    }

    #[test]
    fn inserts_only_rows_after_watermark() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::default();
        store
            .rows
            .borrow_mut()
            .insert("T1".to_string(), vec![Sample::new(at(9, 0), 0.0)]);
        write_cache(
            tmp.path(),
            "T1.csv",
            &[(at(8, 0), 1.0), (at(9, 0), 2.0), (at(9, 30), 3.0), (at(10, 0), 4.0)],
        );

        let mut imported = ImportedTags::new();
        let report = stage(&store, tmp.path(), 1000)
            .load_all(&mut imported)
            .unwrap();

        assert_eq!(report.rows_inserted, 2);
        assert_eq!(report.succeeded, 1);
        assert!(imported.contains(&TagName::new("T1").unwrap()));
        let rows = store.rows.borrow();
        let stamps: Vec<_> = rows["T1"].iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, vec![at(9, 0), at(9, 30), at(10, 0)]);
    }

    #[test]
    fn second_pass_inserts_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::default();
        write_cache(tmp.path(), "T1.csv", &[(at(9, 0), 1.0), (at(10, 0), 2.0)]);
        let stage = stage(&store, tmp.path(), 1000);

        let first = stage.load_all(&mut ImportedTags::new()).unwrap();
        let second = stage.load_all(&mut ImportedTags::new()).unwrap();

        assert_eq!(first.rows_inserted, 2);
        assert_eq!(second.rows_inserted, 0);
        assert_eq!(second.succeeded, 1);
        assert_eq!(second.failed, 0);
    }

    #[test]
    fn already_imported_tag_is_skipped() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::default();
        write_cache(tmp.path(), "T1.csv", &[(at(9, 0), 1.0)]);

        let mut imported = ImportedTags::new();
        imported.insert(TagName::new("T1").unwrap());
        let report = stage(&store, tmp.path(), 1000)
            .load_all(&mut imported)
            .unwrap();

        assert_eq!((report.files_processed, report.skipped), (1, 1));
        assert_eq!(report.rows_inserted, 0);
        assert!(store.rows.borrow().is_empty());
    }

    #[test]
    fn batch_failure_stops_tag_but_not_stage() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore {
            fail_batch: Some(("A".to_string(), 2)),
            ..MemoryStore::default()
        };
        let rows: Vec<(NaiveDateTime, f64)> = (0..5).map(|m| (at(9, m), m as f64)).collect();
        write_cache(tmp.path(), "A.csv", &rows);
        write_cache(tmp.path(), "B.csv", &rows);

        let mut imported = ImportedTags::new();
        let report = stage(&store, tmp.path(), 2)
            .load_all(&mut imported)
            .unwrap();

        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(report.failures[0].item, "A");
        // First batch of A stays committed; third batch never attempted.
        assert_eq!(store.rows.borrow()["A"].len(), 2);
        assert_eq!(store.batches.borrow()["A"], 2);
        assert_eq!(store.rows.borrow()["B"].len(), 5);
        assert_eq!(report.rows_inserted, 7);
        assert!(!imported.contains(&TagName::new("A").unwrap()));
        assert!(!report.per_tag[0].completed);
        assert!(report.per_tag[1].completed);
    }

    #[test]
    fn unreadable_cache_file_is_a_tag_failure() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::default();
        fs::write(tmp.path().join("A.csv"), "timestamp,value\nnope,1\n").unwrap();
        write_cache(tmp.path(), "B.csv", &[(at(9, 0), 1.0)]);

        let report = stage(&store, tmp.path(), 1000)
            .load_all(&mut ImportedTags::new())
            .unwrap();

        assert_eq!((report.files_processed, report.succeeded, report.failed), (2, 1, 1));
    }

    #[test]
    fn connect_failure_is_fatal() {
        struct Down;
        impl StoreConnector for Down {
            type Store = &'static MemoryStore;
            fn connect(&self) -> Result<Self::Store, StoreError> {
                Err(StoreError::Connect {
                    target: "historian".to_string(),
                    source: histsync_db::BackendError::NotAvailable("offline".to_string()),
                })
            }
        }

        let tmp = TempDir::new().unwrap();
        let stage = LoadStage::new(
            Down,
            LoadSettings {
                cache_dir: tmp.path().to_path_buf(),
                file_suffix: ".csv".to_string(),
                batch_size: 1000,
            },
        );
        assert!(matches!(
            stage.load_all(&mut ImportedTags::new()),
            Err(LoadError::Connect(_))
        ));
    }
}
