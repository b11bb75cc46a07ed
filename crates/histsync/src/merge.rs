//! Retention merge of freshly fetched rows into a tag's cached rows.
//!
//! Pure: callers read and write the cache files.

use crate::sample::{Sample, TagName};
use chrono::{Duration, NaiveDateTime};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Result of one merge.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// Merged rows, unique by timestamp, ascending.
    pub samples: Vec<Sample>,
    /// Existing rows overwritten by an incoming row with the same timestamp.
    pub replaced: usize,
    /// Rows dropped because they fell at or before the retention horizon.
    pub expired: usize,
    /// Rows dropped because they are dated after `now`.
    pub future: usize,
}

/// Rows at or before this instant are expired.
pub fn retention_horizon(now: NaiveDateTime, retention: Duration) -> NaiveDateTime {
    now.checked_sub_signed(retention)
        .unwrap_or(NaiveDateTime::MIN)
}

/// Union `incoming` and `existing`, incoming winning on equal timestamps, and
/// keep only rows in `(now - retention, now]`.
///
/// A row dated after `now` would become the tag's watermark and hide real rows
/// until the clock caught up, so it is dropped.
///
/// Within one input a later row wins over an earlier one with the same
/// timestamp.
pub fn merge(
    tag: &TagName,
    incoming: &[Sample],
    existing: &[Sample],
    retention: Duration,
    now: NaiveDateTime,
) -> MergeOutcome {
    let mut by_ts: BTreeMap<NaiveDateTime, f64> = existing
        .iter()
        .map(|s| (s.timestamp, s.value))
        .collect();
    let fresh: BTreeMap<NaiveDateTime, f64> = incoming
        .iter()
        .map(|s| (s.timestamp, s.value))
        .collect();
    let replaced = fresh.keys().filter(|ts| by_ts.contains_key(ts)).count();
    by_ts.extend(fresh);

    let horizon = retention_horizon(now, retention);
    let future = by_ts.range(now..).filter(|(ts, _)| **ts > now).count();
    let total = by_ts.len();
    let samples: Vec<Sample> = by_ts
        .into_iter()
        .filter(|(ts, _)| *ts > horizon && *ts <= now)
        .map(|(timestamp, value)| Sample { timestamp, value })
        .collect();
    let expired = total - samples.len() - future;

    if future > 0 {
        warn!(tag = %tag, rows = future, now = %now, "Dropping rows dated in the future");
    }

    debug!(
        tag = %tag,
        incoming = incoming.len(),
        existing = existing.len(),
        kept = samples.len(),
        replaced,
        expired,
        future,
        "Merged samples"
    );

    MergeOutcome {
        samples,
        replaced,
        expired,
        future,
    }
}
