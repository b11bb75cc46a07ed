//! Per-tag local cache files.
//!
//! One CSV per tag with header `timestamp,value`. Files are only ever
//! replaced whole: new content goes to a hidden sibling which is then renamed
//! over the target, so readers never observe a half-written cache.

use crate::sample::{format_timestamp, parse_timestamp, Sample};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} has no '{column}' column")]
    MissingColumn { path: PathBuf, column: &'static str },

    #[error("{path} line {line}: {reason}")]
    InvalidRow {
        path: PathBuf,
        line: u64,
        reason: String,
    },
}

impl CacheError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn csv(path: &Path, source: csv::Error) -> Self {
        Self::Csv {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True when the file simply does not exist yet.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    /// True when the file was read but its content is unusable.
    pub fn is_corrupt(&self) -> bool {
        match self {
            Self::MissingColumn { .. } | Self::InvalidRow { .. } => true,
            Self::Csv { source, .. } => !matches!(source.kind(), csv::ErrorKind::Io(_)),
            Self::Io { .. } => false,
        }
    }
}

/// Read every sample from a `timestamp,value` CSV file.
///
/// Columns are located by header name; extra columns are ignored. Any row
/// that fails to parse fails the whole read.
pub fn read_samples(path: &Path) -> Result<Vec<Sample>, CacheError> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(io::BufReader::new(file));

    let headers = reader
        .headers()
        .map_err(|e| CacheError::csv(path, e))?
        .clone();
    let column = |name: &'static str| {
        headers
            .iter()
            .position(|h| h.trim_start_matches('\u{feff}').eq_ignore_ascii_case(name))
            .ok_or(CacheError::MissingColumn {
                path: path.to_path_buf(),
                column: name,
            })
    };
    let ts_idx = column("timestamp")?;
    let value_idx = column("value")?;

    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| CacheError::csv(path, e))?;
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let invalid = |reason: String| CacheError::InvalidRow {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let raw_ts = record.get(ts_idx).unwrap_or("");
        let timestamp = parse_timestamp(raw_ts)
            .ok_or_else(|| invalid(format!("invalid timestamp '{}'", raw_ts)))?;
        let raw_value = record.get(value_idx).unwrap_or("");
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid value '{}'", raw_value)))?;

        samples.push(Sample::new(timestamp, value));
    }

    debug!(file = %path.display(), rows = samples.len(), "Read samples");
    Ok(samples)
}

/// Replace `path` with `samples`, atomically.
pub fn write_samples_atomic(path: &Path, samples: &[Sample]) -> Result<(), CacheError> {
    let tmp_path = temp_path_for(path);
    let result = write_samples(&tmp_path, samples)
        .and_then(|()| fs::rename(&tmp_path, path).map_err(|e| CacheError::io(path, e)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn write_samples(path: &Path, samples: &[Sample]) -> Result<(), CacheError> {
    let file = File::create(path).map_err(|e| CacheError::io(path, e))?;
    let mut writer = csv::Writer::from_writer(BufWriter::new(file));

    writer
        .write_record(["timestamp", "value"])
        .map_err(|e| CacheError::csv(path, e))?;
    for sample in samples {
        writer
            .write_record([format_timestamp(&sample.timestamp), sample.value.to_string()])
            .map_err(|e| CacheError::csv(path, e))?;
    }

    let buffered = writer
        .into_inner()
        .map_err(|e| CacheError::io(path, e.into_error()))?;
    let file = buffered
        .into_inner()
        .map_err(|e| CacheError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| CacheError::io(path, e))?;
    Ok(())
}

/// Hidden sibling used while rewriting `path`: `dir/.name.tmp`.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.tmp", name))
}

/// Cache files in `dir` ending with `suffix`, sorted by name.
///
/// Hidden files (in-flight rewrites) are skipped.
pub fn list_cache_files(dir: &Path, suffix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(suffix) {
            continue;
        }
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}
