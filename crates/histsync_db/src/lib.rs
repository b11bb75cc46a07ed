//! Durable store access layer for histsync.
//!
//! A thin synchronous wrapper over DuckDB. Callers issue SQL with typed
//! [`DbValue`] parameters and read [`DbRow`]s back; nothing here knows about
//! tags or samples.
//!
//! # Usage
//!
//! ```rust,ignore
//! use histsync_db::{DbConnection, DbValue};
//!
//! let conn = DbConnection::open(Path::new("historian.duckdb"))?;
//! conn.execute_batch("CREATE TABLE IF NOT EXISTS t (id BIGINT)")?;
//! conn.transaction(|tx| {
//!     tx.execute("INSERT INTO t VALUES (?)", &[DbValue::from(1_i64)])?;
//!     Ok(())
//! })?;
//! ```

mod backend;

pub use backend::{
    BackendError, DbConnection, DbRow, DbTimestamp, DbTransaction, DbValue, FromDbValue,
};
