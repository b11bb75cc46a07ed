//! Durable tag store and per-tag watermarks.
//!
//! The watermark is never cached: it is read from the store each time a tag
//! is loaded.

use crate::sample::{Sample, TagName};
use chrono::NaiveDateTime;
use histsync_db::{BackendError, DbConnection, DbValue};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Latest timestamp already stored for a tag; `None` when the tag has no rows.
pub type Watermark = Option<NaiveDateTime>;

/// Instant every row is newer than when a tag has no watermark.
pub const EPOCH_ZERO: NaiveDateTime = NaiveDateTime::MIN;

pub const TAG_TABLE: &str = "TagData";
const TAG_COLUMNS: [&str; 3] = ["TagName", "Timestamp", "Value"];

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS TagData (
    TagName TEXT NOT NULL,
    "Timestamp" TIMESTAMP NOT NULL,
    Value DOUBLE NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tagdata_tag_ts ON TagData (TagName, "Timestamp");
"#;

const WATERMARK_SQL: &str = r#"SELECT MAX("Timestamp") FROM TagData WHERE TagName = ?"#;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open durable store {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to prepare durable store schema: {0}")]
    Schema(#[source] BackendError),

    #[error("Watermark query for tag {tag} failed: {source}")]
    Watermark {
        tag: String,
        #[source]
        source: BackendError,
    },

    #[error("Batch insert for tag {tag} failed: {source}")]
    Insert {
        tag: String,
        #[source]
        source: BackendError,
    },

    #[error("Query failed: {0}")]
    Query(#[source] BackendError),
}

/// Row sink with a per-tag watermark.
pub trait TagStore {
    /// Maximum stored timestamp for `tag`.
    fn latest_timestamp(&self, tag: &TagName) -> Result<Watermark, StoreError>;

    /// Insert `rows` for `tag` and commit before returning.
    fn insert_batch(&self, tag: &TagName, rows: &[Sample]) -> Result<u64, StoreError>;
}

/// Opens a [`TagStore`] for one load stage run.
pub trait StoreConnector {
    type Store: TagStore;

    fn connect(&self) -> Result<Self::Store, StoreError>;
}

/// True when `ts` is strictly newer than the watermark.
pub fn is_after_watermark(ts: NaiveDateTime, watermark: Watermark) -> bool {
    ts > watermark.unwrap_or(EPOCH_ZERO)
}

/// [`TagStore`] over a DuckDB database.
#[derive(Debug)]
pub struct DuckDbStore {
    conn: DbConnection,
}

impl DuckDbStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = DbConnection::open(path).map_err(|source| StoreError::Connect {
            target: path.display().to_string(),
            source,
        })?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = DbConnection::open_in_memory().map_err(|source| StoreError::Connect {
            target: ":memory:".to_string(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Wrap an open connection, creating the tag table if needed.
    pub fn from_connection(conn: DbConnection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL).map_err(StoreError::Schema)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &DbConnection {
        &self.conn
    }

    /// Stored row count for `tag`.
    pub fn row_count(&self, tag: &TagName) -> Result<i64, StoreError> {
        self.conn
            .query_scalar::<i64>(
                "SELECT COUNT(*) FROM TagData WHERE TagName = ?",
                &[DbValue::from(tag.as_str())],
            )
            .map_err(StoreError::Query)
    }

    /// Stored rows for `tag`, oldest first.
    pub fn samples(&self, tag: &TagName) -> Result<Vec<Sample>, StoreError> {
        let rows = self
            .conn
            .query_all(
                r#"SELECT "Timestamp", Value FROM TagData WHERE TagName = ? ORDER BY "Timestamp""#,
                &[DbValue::from(tag.as_str())],
            )
            .map_err(StoreError::Query)?;
        rows.iter()
            .map(|row| Ok(Sample::new(row.get(0)?, row.get(1)?)))
            .collect::<Result<Vec<_>, BackendError>>()
            .map_err(StoreError::Query)
    }
}

impl TagStore for DuckDbStore {
    fn latest_timestamp(&self, tag: &TagName) -> Result<Watermark, StoreError> {
        let watermark = self
            .conn
            .query_scalar::<Option<NaiveDateTime>>(WATERMARK_SQL, &[DbValue::from(tag.as_str())])
            .map_err(|source| StoreError::Watermark {
                tag: tag.to_string(),
                source,
            })?;
        debug!(tag = %tag, watermark = ?watermark, "Read watermark");
        Ok(watermark)
    }

    fn insert_batch(&self, tag: &TagName, rows: &[Sample]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let values: Vec<Vec<DbValue>> = rows
            .iter()
            .map(|s| {
                vec![
                    DbValue::from(tag.as_str()),
                    DbValue::from(s.timestamp),
                    DbValue::from(s.value),
                ]
            })
            .collect();

        self.conn
            .transaction(|tx| tx.bulk_insert_rows(TAG_TABLE, &TAG_COLUMNS, &values))
            .map_err(|source| StoreError::Insert {
                tag: tag.to_string(),
                source,
            })
    }
}

/// Opens a [`DuckDbStore`] at a fixed path.
#[derive(Debug, Clone)]
pub struct DuckDbConnector {
    path: PathBuf,
}

impl DuckDbConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreConnector for DuckDbConnector {
    type Store = DuckDbStore;

    fn connect(&self) -> Result<DuckDbStore, StoreError> {
        let store = DuckDbStore::open(&self.path)?;
        info!(database = %self.path.display(), "Connected to durable store");
        Ok(store)
    }
}
