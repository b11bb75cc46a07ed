//! Tags, samples, and their text forms.

use chrono::{NaiveDateTime, Timelike};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Timestamp layout used in cache files and in the lock record date part.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse layouts accepted on read; the first matching one wins.
const TIMESTAMP_PARSE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// One measurement of one tag.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Sample {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: NaiveDateTime, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Identifier of one time series, derived from a data file name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TagName(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TagNameError {
    #[error("file name '{name}' does not end with '{suffix}'")]
    MissingSuffix { name: String, suffix: String },

    #[error("file name '{0}' yields an empty tag")]
    Empty(String),

    #[error("file name '{0}' yields a tag with a path separator or control character")]
    InvalidCharacters(String),
}

impl TagName {
    /// Strip `suffix` from a data file name.
    pub fn from_file_name(name: &str, suffix: &str) -> Result<Self, TagNameError> {
        let tag = name
            .strip_suffix(suffix)
            .ok_or_else(|| TagNameError::MissingSuffix {
                name: name.to_string(),
                suffix: suffix.to_string(),
            })?;
        Self::new(tag).map_err(|err| match err {
            TagNameError::Empty(_) => TagNameError::Empty(name.to_string()),
            TagNameError::InvalidCharacters(_) => {
                TagNameError::InvalidCharacters(name.to_string())
            }
            other => other,
        })
    }

    pub fn new(tag: &str) -> Result<Self, TagNameError> {
        if tag.is_empty() || tag == "." || tag == ".." {
            return Err(TagNameError::Empty(tag.to_string()));
        }
        if tag
            .chars()
            .any(|c| c == '/' || c == '\\' || c.is_control())
        {
            return Err(TagNameError::InvalidCharacters(tag.to_string()));
        }
        Ok(Self(tag.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of this tag's cache file.
    pub fn file_name(&self, suffix: &str) -> String {
        format!("{}{}", self.0, suffix)
    }
}

impl fmt::Display for TagName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TagName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Parse a sample timestamp, dropping any sub-second part.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_PARSE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .and_then(|ts| ts.with_nanosecond(0))
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn tag_strips_fixed_suffix() {
        let tag = TagName::from_file_name("PLANT.FIC101.F_CV.csv", ".F_CV.csv").unwrap();
        assert_eq!(tag.as_str(), "PLANT.FIC101");
        assert_eq!(tag.file_name(".F_CV.csv"), "PLANT.FIC101.F_CV.csv");
    }

    #[test]
    fn tag_rejects_malformed_names() {
        assert!(matches!(
            TagName::from_file_name("notes.txt", ".csv"),
            Err(TagNameError::MissingSuffix { .. })
        ));
        assert!(matches!(
            TagName::from_file_name(".csv", ".csv"),
            Err(TagNameError::Empty(_))
        ));
        assert!(matches!(
            TagName::from_file_name("...csv", ".csv"),
            Err(TagNameError::Empty(_))
        ));
        assert!(matches!(
            TagName::from_file_name("a\\b.csv", ".csv"),
            Err(TagNameError::InvalidCharacters(_))
        ));
        assert!(matches!(
            TagName::from_file_name("a\nb.csv", ".csv"),
            Err(TagNameError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn parses_common_timestamp_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-05 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-05 10:00:00.750"), Some(expected));
        assert_eq!(parse_timestamp(" 2024-01-05 10:00 "), Some(expected));
        assert_eq!(parse_timestamp("05/01/2024 10:00"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn formats_at_second_granularity() {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 5)
            .unwrap()
            .and_hms_opt(9, 5, 7)
            .unwrap();
        assert_eq!(format_timestamp(&ts), "2024-01-05 09:05:07");
    }
}
