//! Per-item outcome values shared by the stage reports.

use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// One file or tag that failed within a stage. The stage carries on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub item: String,
    pub reason: String,
}

impl ItemFailure {
    pub fn new(item: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            item: item.into(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
pub(crate) fn duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
}

/// Rows per second, or zero for an instant interval.
pub fn rate_per_sec(rows: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        rows as f64 / secs
    } else {
        0.0
    }
}
