//! Core types for RingDB

use crate::{Result, RingError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Dense series identifier, assigned from 1 in creation order
pub type SeriesId = u64;

/// Global write sequence number
pub type Seq = u64;

/// Series identity: metric name plus sorted tag set
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Metric name (e.g. "cpu.user"); a leading `!` marks an event series
    pub metric: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Parse `"metric k=v k2=v2"`. At least one tag is required.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let metric = parts
            .next()
            .ok_or_else(|| RingError::InvalidFormat("empty series name".into()))?;
        let mut key = SeriesKey::new(metric);
        for tag in parts {
            match tag.split_once('=') {
                Some((k, v)) if !k.is_empty() && !v.is_empty() => {
                    key.tags.insert(k.to_string(), v.to_string());
                }
                _ => {
                    return Err(RingError::InvalidFormat(format!("bad tag `{}`", tag)));
                }
            }
        }
        if key.tags.is_empty() {
            return Err(RingError::InvalidFormat("series has no tags".into()));
        }
        Ok(key)
    }

    /// Canonical representation: metric followed by `k=v` pairs sorted by key
    pub fn canonical(&self) -> String {
        let mut s = self.metric.clone();
        for (k, v) in &self.tags {
            s.push(' ');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Event series carry string payloads instead of numbers
    pub fn is_event(&self) -> bool {
        self.metric.starts_with('!')
    }

    /// Keep only the listed tags; tags the series lacks are skipped
    pub fn project(&self, tags: &[String]) -> SeriesKey {
        let mut key = SeriesKey::new(self.metric.clone());
        for name in tags {
            if let Some(v) = self.tags.get(name) {
                key.tags.insert(name.clone(), v.clone());
            }
        }
        key
    }

    /// Canonical tag part only (`k=v k2=v2`)
    pub fn tag_line(&self) -> String {
        self.tags
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Sample payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Numeric sample
    Float(f64),
    /// Event payload
    Event(String),
}

impl Value {
    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Event(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Event(v.to_string())
    }
}

/// A sample as it arrives from the ingestion path
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub series: SeriesId,
    pub timestamp: Timestamp,
    pub value: Value,
}

impl Sample {
    pub fn new(series: SeriesId, timestamp: Timestamp, value: impl Into<Value>) -> Self {
        Self {
            series,
            timestamp,
            value: value.into(),
        }
    }
}

/// A sample stamped with its global sequence number; the unit of
/// persistence in both the WAL and the volumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub seq: Seq,
    pub series: SeriesId,
    pub timestamp: Timestamp,
    pub value: Value,
}

/// Scan direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Query time range. `from < to` scans `[from, to)` forward,
/// `from > to` scans `(to, from]` backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Timestamp,
    pub to: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(from: Timestamp, to: Timestamp) -> Self {
        Self { from, to }
    }

    pub fn direction(&self) -> Direction {
        if self.from > self.to {
            Direction::Backward
        } else {
            Direction::Forward
        }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        match self.direction() {
            Direction::Forward => ts >= self.from && ts < self.to,
            Direction::Backward => ts > self.to && ts <= self.from,
        }
    }

    /// Bounds over `(timestamp, seq)` keys covering this range
    pub fn key_bounds(&self) -> (Bound<(Timestamp, Seq)>, Bound<(Timestamp, Seq)>) {
        match self.direction() {
            Direction::Forward => (
                Bound::Included((self.from, 0)),
                Bound::Excluded((self.to, 0)),
            ),
            Direction::Backward => (
                Bound::Excluded((self.to, Seq::MAX)),
                Bound::Included((self.from, Seq::MAX)),
            ),
        }
    }
}

/// How samples with equal timestamps in one series are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Keep every sample in arrival order
    #[default]
    Append,
    /// Keep only the most recent sample
    Overwrite,
}

impl DuplicatePolicy {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "append" => Some(DuplicatePolicy::Append),
            "overwrite" => Some(DuplicatePolicy::Overwrite),
            _ => None,
        }
    }
}

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
}

impl AggregateFunction {
    /// Parse from string
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "count" => Some(AggregateFunction::Count),
            "sum" => Some(AggregateFunction::Sum),
            "mean" | "avg" => Some(AggregateFunction::Mean),
            "min" => Some(AggregateFunction::Min),
            "max" => Some(AggregateFunction::Max),
            "first" => Some(AggregateFunction::First),
            "last" => Some(AggregateFunction::Last),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Mean => "mean",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
        }
    }
}
