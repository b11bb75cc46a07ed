//! Synchronous DuckDB backend.
//!
//! Every call blocks the caller until DuckDB returns. Statements are traced
//! with a `db.*` span carrying the leading SQL keyword, a stable hash of the
//! statement text, and the elapsed milliseconds.

use chrono::{DateTime, NaiveDateTime};
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug_span, info};

/// Errors from database backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backend not available: {0}")]
    NotAvailable(String),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),
}

/// Timezone-naive timestamp as stored in `TIMESTAMP` columns.
///
/// DuckDB `TIMESTAMP` has no zone; values go in and come out exactly as the
/// caller wrote them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbTimestamp {
    inner: NaiveDateTime,
}

impl DbTimestamp {
    pub fn from_naive(value: NaiveDateTime) -> Self {
        Self { inner: value }
    }

    pub fn as_naive(&self) -> NaiveDateTime {
        self.inner
    }

    /// Microseconds since 1970-01-01 00:00:00 (may be negative).
    pub fn unix_micros(&self) -> i64 {
        self.inner.and_utc().timestamp_micros()
    }

    /// Build from microseconds since 1970-01-01 00:00:00.
    pub fn from_unix_micros(micros: i64) -> Option<Self> {
        let secs = micros.div_euclid(1_000_000);
        let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::from_timestamp(secs, nanos).map(|dt| Self {
            inner: dt.naive_utc(),
        })
    }
}

impl From<NaiveDateTime> for DbTimestamp {
    fn from(value: NaiveDateTime) -> Self {
        Self::from_naive(value)
    }
}

/// Value type for query parameters and results.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Timestamp(DbTimestamp),
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<DbTimestamp> for DbValue {
    fn from(v: DbTimestamp) -> Self {
        DbValue::Timestamp(v)
    }
}

impl From<NaiveDateTime> for DbValue {
    fn from(v: NaiveDateTime) -> Self {
        DbValue::Timestamp(DbTimestamp::from_naive(v))
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone)]
pub struct DbRow {
    values: Vec<DbValue>,
}

impl DbRow {

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, BackendError> {
        self.values
            .get(index)
            .ok_or_else(|| {
                BackendError::TypeConversion(format!("Column index {} out of bounds", index))
            })
            .and_then(|v| T::from_db_value(v))
    }
}

/// Trait for converting from DbValue.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError>;
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Null => Err(BackendError::TypeConversion(
                "i64 field is NULL - use Option<i64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected integer".to_string())),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            DbValue::Null => Err(BackendError::TypeConversion(
                "f64 field is NULL - use Option<f64> for nullable columns".to_string(),
            )),
            _ => Err(BackendError::TypeConversion("Expected real".to_string())),
        }
    }
}

impl FromDbValue for DbTimestamp {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Timestamp(v) => Ok(*v),
            DbValue::Null => Err(BackendError::TypeConversion(
                "DbTimestamp field is NULL - use Option<DbTimestamp> for nullable columns"
                    .to_string(),
            )),
            _ => Err(BackendError::TypeConversion(
                "Expected timestamp".to_string(),
            )),
        }
    }
}

impl FromDbValue for NaiveDateTime {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        DbTimestamp::from_db_value(value).map(|ts| ts.as_naive())
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, BackendError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}

/// Single-threaded DuckDB connection.
///
/// Clones share the same underlying connection.
#[derive(Clone)]
pub struct DbConnection {
    conn: Rc<duckdb::Connection>,
}

impl std::fmt::Debug for DbConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConnection")
            .field("backend", &"DuckDB")
            .finish()
    }
}

impl DbConnection {
    /// Open or create a DuckDB database file.
    ///
    /// The parent directory is created when missing.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Database(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Rc::new(duckdb::Connection::open(path)?);
        info!("Opened DuckDB database: {}", path.display());
        Ok(Self { conn })
    }

    /// Open an in-memory DuckDB database (for testing).
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Rc::new(duckdb::Connection::open_in_memory()?);
        info!("Opened in-memory DuckDB database");
        Ok(Self { conn })
    }

    /// Execute a SQL statement (no results).
    pub fn execute(&self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn.as_ref(), sql, params)
    }

    /// Execute a batch of SQL statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), BackendError> {
        execute_batch_on_conn(self.conn.as_ref(), sql)
    }

    /// Bulk insert rows into a table (auto-commit).
    ///
    /// Column order must match the row value order.
    pub fn bulk_insert_rows(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        bulk_insert_rows_internal(self.conn.as_ref(), table, columns, rows)
    }

    /// Query and return all rows.
    pub fn query_all(&self, sql: &str, params: &[DbValue]) -> Result<Vec<DbRow>, BackendError> {
        query_on_conn(self.conn.as_ref(), sql, params)
    }

    /// Query and return the first row, if any.
    pub fn query_optional(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<Option<DbRow>, BackendError> {
        let rows = self.query_all(sql, params)?;
        Ok(rows.into_iter().next())
    }

    /// Query and return exactly one row.
    pub fn query_one(&self, sql: &str, params: &[DbValue]) -> Result<DbRow, BackendError> {
        self.query_optional(sql, params)?
            .ok_or_else(|| BackendError::Query("Expected one row, got none".to_string()))
    }

    /// Query and return a single scalar value.
    pub fn query_scalar<T: FromDbValue>(
        &self,
        sql: &str,
        params: &[DbValue],
    ) -> Result<T, BackendError> {
        let row = self.query_one(sql, params)?;
        row.get(0)
    }

    /// Run `op` inside `BEGIN` / `COMMIT`, rolling back if it fails.
    pub fn transaction<T, F>(&self, op: F) -> Result<T, BackendError>
    where
        F: for<'a> FnOnce(&'a mut DbTransaction<'a>) -> Result<T, BackendError>,
    {
        self.conn.execute_batch("BEGIN")?;
        let mut tx = DbTransaction {
            conn: self.conn.as_ref(),
        };
        let result = op(&mut tx);

        match result {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(err) => match self.conn.execute_batch("ROLLBACK") {
                Ok(()) => Err(err),
                Err(rollback_err) => Err(BackendError::Transaction(format!(
                    "Transaction failed: {}; rollback failed: {}",
                    err, rollback_err
                ))),
            },
        }
    }
}

/// Statements issued inside [`DbConnection::transaction`].
pub struct DbTransaction<'a> {
    conn: &'a duckdb::Connection,
}

impl<'a> DbTransaction<'a> {
    pub fn execute(&mut self, sql: &str, params: &[DbValue]) -> Result<u64, BackendError> {
        execute_on_conn(self.conn, sql, params)
    }

    /// Bulk insert rows into a table within this transaction.
    pub fn bulk_insert_rows(
        &mut self,
        table: &str,
        columns: &[&str],
        rows: &[Vec<DbValue>],
    ) -> Result<u64, BackendError> {
        bulk_insert_rows_internal(self.conn, table, columns, rows)
    }
}

fn execute_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<u64, BackendError> {
    let span = debug_span!(
        "db.exec",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let duckdb_params = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> = duckdb_params
        .iter()
        .map(|v| v as &dyn duckdb::ToSql)
        .collect();
    let rows = stmt.execute(param_refs.as_slice())?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(rows as u64)
}

fn execute_batch_on_conn(conn: &duckdb::Connection, sql: &str) -> Result<(), BackendError> {
    let span = debug_span!(
        "db.exec_batch",
        op = "BATCH",
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();
    conn.execute_batch(sql)?;
    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(())
}

fn query_on_conn(
    conn: &duckdb::Connection,
    sql: &str,
    params: &[DbValue],
) -> Result<Vec<DbRow>, BackendError> {
    let span = debug_span!(
        "db.query",
        op = sql_op_name(sql),
        sql_hash = %hash_sql(sql),
        duration_ms = tracing::field::Empty
    );
    let _guard = span.enter();
    let start = Instant::now();

    let mut stmt = conn.prepare(sql)?;
    let duckdb_params = to_duckdb_params(params);
    let param_refs: Vec<&dyn duckdb::ToSql> = duckdb_params
        .iter()
        .map(|v| v as &dyn duckdb::ToSql)
        .collect();

    let mut rows_iter = stmt.query(param_refs.as_slice())?;

    let column_count = match rows_iter.as_ref() {
        Some(stmt_ref) => stmt_ref.column_count(),
        None => return Ok(Vec::new()),
    };

    let mut result = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let values = (0..column_count)
            .map(|i| duckdb_value_to_db_value(row, i))
            .collect::<Result<Vec<_>, _>>()?;
        result.push(DbRow { values });
    }

    span.record("duration_ms", start.elapsed().as_millis() as u64);
    Ok(result)
}

fn to_duckdb_params(params: &[DbValue]) -> Vec<duckdb::types::Value> {
    params
        .iter()
        .map(|p| match p {
            DbValue::Null => duckdb::types::Value::Null,
            DbValue::Integer(v) => duckdb::types::Value::BigInt(*v),
            DbValue::Real(v) => duckdb::types::Value::Double(*v),
            DbValue::Text(v) => duckdb::types::Value::Text(v.clone()),
            DbValue::Timestamp(v) => duckdb::types::Value::Timestamp(
                duckdb::types::TimeUnit::Microsecond,
                v.unix_micros(),
            ),
        })
        .collect()
}

fn duckdb_value_to_db_value(row: &duckdb::Row, index: usize) -> Result<DbValue, BackendError> {
    use duckdb::types::{TimeUnit, ValueRef};

    let value = match row.get_ref(index)? {
        ValueRef::Null => DbValue::Null,
        ValueRef::Boolean(v) => DbValue::Integer(v as i64),
        ValueRef::TinyInt(v) => DbValue::Integer(v as i64),
        ValueRef::SmallInt(v) => DbValue::Integer(v as i64),
        ValueRef::Int(v) => DbValue::Integer(v as i64),
        ValueRef::BigInt(v) => DbValue::Integer(v),
        ValueRef::HugeInt(v) => DbValue::Integer(v as i64),
        ValueRef::UTinyInt(v) => DbValue::Integer(v as i64),
        ValueRef::USmallInt(v) => DbValue::Integer(v as i64),
        ValueRef::UInt(v) => DbValue::Integer(v as i64),
        ValueRef::UBigInt(v) => DbValue::Integer(v as i64),
        ValueRef::Float(v) => DbValue::Real(v as f64),
        ValueRef::Double(v) => DbValue::Real(v),
        ValueRef::Text(v) => DbValue::Text(String::from_utf8_lossy(v).to_string()),
        ValueRef::Timestamp(unit, v) => {
            let micros = match unit {
                TimeUnit::Second => v * 1_000_000,
                TimeUnit::Millisecond => v * 1_000,
                TimeUnit::Microsecond => v,
                TimeUnit::Nanosecond => v / 1_000,
            };
            let ts = DbTimestamp::from_unix_micros(micros).ok_or_else(|| {
                BackendError::TypeConversion(format!("Timestamp out of range: {}", micros))
            })?;
            DbValue::Timestamp(ts)
        }
        other => {
            tracing::warn!(
                "DuckDB type {:?} at column {} mapped to debug string",
                std::mem::discriminant(&other),
                index
            );
            DbValue::Text(format!("{:?}", other))
        }
    };
    Ok(value)
}

/// Above this many bound parameters the DuckDB appender is used instead of
/// a multi-row `INSERT ... VALUES`.
const DEFAULT_MAX_PARAMS: usize = 999;

fn bulk_insert_rows_internal(
    conn: &duckdb::Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<DbValue>],
) -> Result<u64, BackendError> {
    if rows.is_empty() {
        return Ok(0);
    }
    if columns.is_empty() {
        return Err(BackendError::InvalidInput(
            "bulk_insert_rows requires at least one column".to_string(),
        ));
    }

    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(BackendError::InvalidInput(format!(
                "Row {} has {} values, expected {}",
                index,
                row.len(),
                columns.len()
            )));
        }
    }

    let total_params = rows.len().saturating_mul(columns.len());
    if total_params <= DEFAULT_MAX_PARAMS {
        return bulk_insert_rows_values(conn, table, columns, rows);
    }

    // The appender writes every table column in declaration order.
    let mut appender = conn.appender(table)?;
    for row in rows {
        let duckdb_params = to_duckdb_params(row);
        let param_refs: Vec<&dyn duckdb::ToSql> = duckdb_params
            .iter()
            .map(|v| v as &dyn duckdb::ToSql)
            .collect();
        appender.append_row(param_refs.as_slice())?;
    }
    appender.flush()?;
    Ok(rows.len() as u64)
}

fn bulk_insert_rows_values(
    conn: &duckdb::Connection,
    table: &str,
    columns: &[&str],
    rows: &[Vec<DbValue>],
) -> Result<u64, BackendError> {
    let placeholders = vec!["?"; columns.len()].join(", ");
    let row_clause = format!("({})", placeholders);
    let values_clause = vec![row_clause.as_str(); rows.len()].join(", ");
    let quoted_cols = columns
        .iter()
        .map(|col| quote_ident(col))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident_path(table),
        quoted_cols,
        values_clause
    );

    let params: Vec<DbValue> = rows.iter().flat_map(|row| row.iter().cloned()).collect();
    execute_on_conn(conn, &sql, &params)?;
    Ok(rows.len() as u64)
}

fn quote_ident(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len() + 2);
    escaped.push('"');
    for ch in name.chars() {
        if ch == '"' {
            escaped.push('"');
        }
        escaped.push(ch);
    }
    escaped.push('"');
    escaped
}

fn quote_ident_path(path: &str) -> String {
    path.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

fn sql_op_name(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or("unknown")
}

fn hash_sql(sql: &str) -> String {
    // FNV-1a 64-bit hash for low-cardinality, stable identification.
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in sql.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    #[test]
    fn bulk_insert_rows_inserts_expected_rows() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64), DbValue::from("alpha")],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let inserted = conn.bulk_insert_rows("t", &["id", "name"], &rows).unwrap();

        assert_eq!(inserted, 2);
        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn bulk_insert_rows_uses_appender_for_large_batches() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT, at TIMESTAMP, v DOUBLE)")
            .unwrap();

        let rows: Vec<Vec<DbValue>> = (0..1_500_u32)
            .map(|i| {
                vec![
                    DbValue::from("tag"),
                    DbValue::from(ts(0, 0, 0) + chrono::Duration::seconds(i as i64)),
                    DbValue::from(i as f64),
                ]
            })
            .collect();
        let inserted = conn.bulk_insert_rows("t", &["name", "at", "v"], &rows).unwrap();
        assert_eq!(inserted, 1_500);

        let max: Option<NaiveDateTime> = conn.query_scalar("SELECT MAX(at) FROM t", &[]).unwrap();
        assert_eq!(max, Some(ts(0, 24, 59)));
    }

    #[test]
    fn bulk_insert_rows_rejects_mismatched_row_len() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT, name TEXT)")
            .unwrap();

        let rows = vec![
            vec![DbValue::from(1_i64)],
            vec![DbValue::from(2_i64), DbValue::from("beta")],
        ];
        let err = conn
            .bulk_insert_rows("t", &["id", "name"], &rows)
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidInput(_)));
    }

    #[test]
    fn bulk_insert_rows_empty_is_noop() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT)").unwrap();

        let inserted = conn.bulk_insert_rows("t", &["id"], &[]).unwrap();
        assert_eq!(inserted, 0);
    }

    #[test]
    fn timestamps_round_trip_without_zone_shift() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (at TIMESTAMP)").unwrap();
        conn.execute("INSERT INTO t VALUES (?)", &[DbValue::from(ts(10, 0, 0))])
            .unwrap();

        let back: NaiveDateTime = conn.query_scalar("SELECT at FROM t", &[]).unwrap();
        assert_eq!(back, ts(10, 0, 0));
    }

    #[test]
    fn max_over_empty_table_is_null() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (at TIMESTAMP)").unwrap();

        let max: Option<NaiveDateTime> = conn.query_scalar("SELECT MAX(at) FROM t", &[]).unwrap();
        assert!(max.is_none());
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let conn = DbConnection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id BIGINT)").unwrap();

        let result: Result<(), BackendError> = conn.transaction(|tx| {
            tx.execute("INSERT INTO t VALUES (?)", &[DbValue::from(1_i64)])?;
            Err(BackendError::InvalidInput("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn.query_scalar("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(count, 0);
    }
}
