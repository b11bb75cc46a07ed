//! Command-line interface for histsync.

pub mod config;
pub mod error;
pub mod exit;
pub mod output;
pub mod run;
pub mod status;
