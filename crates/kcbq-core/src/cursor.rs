//! Source-side position state.
//!
//! Two cursor flavours exist: an opaque pagination token for resumable full
//! scans, and a watermark over an incrementing id plus an updated-at column
//! for change-only polling of a mutable table.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque token returned by the previous page fetch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageToken(pub String);

impl PageToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last row consumed under `(timestamp, incrementing id)` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_incrementing_value: i64,
    pub last_timestamp: DateTime<Utc>,
}

impl Watermark {
    pub fn new(last_incrementing_value: i64, last_timestamp: DateTime<Utc>) -> Self {
        Self {
            last_incrementing_value,
            last_timestamp,
        }
    }

    /// Moves the watermark to a processed row's position.
    ///
    /// Rows ordering below the current watermark leave it unchanged, so it
    /// never regresses.
    pub fn advance(&mut self, incrementing_value: i64, timestamp: DateTime<Utc>) {
        let row = Self::new(incrementing_value, timestamp);
        if row >= *self {
            *self = row;
        }
    }

    /// Reads the watermark columns of a row.
    pub fn observe(
        row: &Map<String, Value>,
        incrementing_column: &str,
        timestamp_column: &str,
    ) -> Result<(i64, DateTime<Utc>), String> {
        let inc = row
            .get(incrementing_column)
            .and_then(parse_incrementing)
            .ok_or_else(|| format!("column `{incrementing_column}` is missing or not an integer"))?;
        let ts = row
            .get(timestamp_column)
            .and_then(parse_timestamp)
            .ok_or_else(|| format!("column `{timestamp_column}` is missing or not a timestamp"))?;
        Ok((inc, ts))
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(-1, DateTime::<Utc>::UNIX_EPOCH)
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_timestamp
            .cmp(&other.last_timestamp)
            .then(self.last_incrementing_value.cmp(&other.last_incrementing_value))
    }
}

/// Integer from a JSON number or a numeric string (INT64 arrives as a string
/// over REST).
pub fn parse_incrementing(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Timestamp from RFC 3339, `YYYY-MM-DD HH:MM:SS[.f][ UTC]`, or epoch
/// seconds (number or string).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_f64().and_then(from_epoch_seconds),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            let naive = s.trim_end_matches(" UTC");
            for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
                    return Some(Utc.from_utc_datetime(&ts));
                }
            }
            s.parse::<f64>().ok().and_then(from_epoch_seconds)
        }
        _ => None,
    }
}

pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
}

/// Position state of a source task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// `None` means start of table.
    Page { token: Option<PageToken> },
    Watermark(Watermark),
}

impl Cursor {
    pub fn page_token(&self) -> Option<&PageToken> {
        match self {
            Cursor::Page { token } => token.as_ref(),
            Cursor::Watermark(_) => None,
        }
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        match self {
            Cursor::Watermark(w) => Some(w),
            Cursor::Page { .. } => None,
        }
    }
}

/// Arguments of a page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub token: Option<PageToken>,
    pub max_results: usize,
}

/// One fetched page. `next_token` is `None` when the backend has nothing to
/// say about the next position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowPage {
    pub rows: Vec<Map<String, Value>>,
    pub next_token: Option<PageToken>,
    pub total_rows: Option<u64>,
}

/// Arguments of a watermark query selecting rows strictly past the watermark
/// under `(ts, inc)` ordering:
/// `ts > last_ts OR (ts = last_ts AND inc > last_inc) ORDER BY ts, inc LIMIT limit`.
///
/// A row sharing the last timestamp is still selected through its id, and a
/// row behind the watermark is never selected again, so a `LIMIT`ed batch
/// always makes progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalQuery {
    pub incrementing_column: String,
    pub timestamp_column: String,
    pub watermark: Watermark,
    pub limit: usize,
}

impl IncrementalQuery {
    /// Whether a row falls past the watermark.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        let inc = row.get(&self.incrementing_column).and_then(parse_incrementing);
        let ts = row.get(&self.timestamp_column).and_then(parse_timestamp);
        match (inc, ts) {
            (Some(inc), Some(ts)) => Watermark::new(inc, ts) > self.watermark,
            (None, Some(ts)) => ts > self.watermark.last_timestamp,
            _ => false,
        }
    }
}
