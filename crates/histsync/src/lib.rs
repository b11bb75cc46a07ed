//! Incremental historian tag sync.
//!
//! A run takes the [`RunLock`], fetches per-tag CSV exports from a
//! [`RemoteSource`] into the local cache (merging with retention), then loads
//! every cached tag into the durable store, inserting only rows newer than the
//! tag's stored watermark.
//!
//! ```rust,ignore
//! use histsync::{local_pipeline, Config, RunOutcome, SystemClock};
//! use std::sync::Arc;
//!
//! let (config, _) = Config::resolve(None)?;
//! let pipeline = local_pipeline(&config, Arc::new(SystemClock))?;
//! match pipeline.run_once() {
//!     RunOutcome::Completed(summary) => println!("{:?}", summary.status),
//!     RunOutcome::SkippedBusy => println!("already running"),
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod fetch;
pub mod load;
pub mod lock;
pub mod merge;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod sample;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{histsync_home, Config, ConfigError};
pub use fetch::{FetchError, FetchReport, FetchSettings, FetchStage};
pub use load::{ImportedTags, LoadError, LoadReport, LoadSettings, LoadStage, TagLoad};
pub use lock::{LockError, LockState, RunLock, RunLockGuard};
pub use merge::{merge, MergeOutcome};
pub use pipeline::{local_pipeline, Pipeline, RunOutcome, RunStatus, RunSummary};
pub use remote::{LocalDirSource, RemoteError, RemoteSource};
pub use report::ItemFailure;
pub use sample::{Sample, TagName, TagNameError};
pub use store::{DuckDbConnector, DuckDbStore, StoreConnector, StoreError, TagStore, Watermark};
