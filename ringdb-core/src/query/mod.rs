//! Query engine for RingDB
//!
//! A query is a JSON document naming exactly one verb (`select`,
//! `select-events`, `aggregate`, `group-aggregate`, `join`) plus shaping
//! options and an optional `apply` chain of row transforms. It is parsed
//! into a [`Query`], resolved against the series index into a
//! [`QueryPlan`], and executed into a stream of CSV rows.

mod aggregates;
mod apply;
mod executor;
mod merge;
mod parser;
mod planner;
mod sample;

pub use aggregates::{accumulator, Accumulator};
pub use apply::{ApplyStep, BinOp, Expr, Pipeline};
pub use executor::QueryExecutor;
pub use merge::Merge;
pub use parser::QueryParser;
pub use planner::{JoinGroup, PlanKind, QueryPlan, QueryPlanner, Stream};
pub use sample::{sax_word, Bucketer};

use crate::index::TagFilter;
use crate::time::format_timestamp;
use crate::{AggregateFunction, TimeRange, Timestamp};

// ============================================================================
// Parsed query
// ============================================================================

/// Parsed query
#[derive(Debug, Clone)]
pub struct Query {
    pub kind: QueryKind,
    /// Required for everything except metadata queries
    pub range: Option<TimeRange>,
    /// `where` clause
    pub tags: TagFilter,
    pub group_by: GroupBy,
    pub order_by: OrderBy,
    pub filter: ValueFilter,
    pub sample: Option<SampleSpec>,
    /// `apply`, in order
    pub apply: Vec<ApplyStep>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// The query verb and its arguments
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    Select {
        metric: String,
    },
    /// `select: "meta:names"` or `"meta:names:<metric>"`
    Names {
        metric: Option<String>,
    },
    SelectEvents {
        metric: String,
    },
    Aggregate {
        metric: String,
        func: AggregateFunction,
    },
    /// Several metrics are aligned by tag set like `join`
    GroupAggregate {
        metrics: Vec<String>,
        funcs: Vec<AggregateFunction>,
        step: i64,
    },
    Join {
        metrics: Vec<String>,
    },
}

/// `group-by`: tag names and/or a time step for sampling
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupBy {
    pub tags: Vec<String>,
    pub time: Option<i64>,
}

/// `order-by`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    Time,
    Series,
}

/// `filter`: value thresholds, `gt`/`lt` exclusive and `ge`/`le` inclusive
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ValueFilter {
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub ge: Option<f64>,
    pub le: Option<f64>,
}

impl ValueFilter {
    pub fn is_empty(&self) -> bool {
        self.gt.is_none() && self.lt.is_none() && self.ge.is_none() && self.le.is_none()
    }

    pub fn accepts(&self, v: f64) -> bool {
        self.gt.map_or(true, |t| v > t)
            && self.lt.map_or(true, |t| v < t)
            && self.ge.map_or(true, |t| v >= t)
            && self.le.map_or(true, |t| v <= t)
    }

    /// Every numeric value in the row passes; absent values are ignored
    pub fn accepts_row(&self, values: &[QueryValue]) -> bool {
        values
            .iter()
            .filter_map(QueryValue::as_f64)
            .all(|v| self.accepts(v))
    }
}

/// Per-bucket reduction used by PAA transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaaFunc {
    Mean,
    Median,
    Max,
    Min,
    First,
    Last,
}

impl PaaFunc {
    /// Parse a transform name (`paa`, `median-paa`, ...)
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "paa" => Some(PaaFunc::Mean),
            "median-paa" => Some(PaaFunc::Median),
            "max-paa" => Some(PaaFunc::Max),
            "min-paa" => Some(PaaFunc::Min),
            "first-paa" => Some(PaaFunc::First),
            "last-paa" => Some(PaaFunc::Last),
            _ => None,
        }
    }
}

/// `sample` transform
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleSpec {
    Paa(PaaFunc),
    Sax { alphabet: usize, window: usize },
}

// ============================================================================
// Result rows
// ============================================================================

/// A single result row
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    /// Series (or group) name
    pub series: String,
    /// Absent for metadata rows
    pub time: Option<Timestamp>,
    pub values: Vec<QueryValue>,
}

impl QueryRow {
    pub fn new(series: impl Into<String>, time: Timestamp, values: Vec<QueryValue>) -> Self {
        Self {
            series: series.into(),
            time: Some(time),
            values,
        }
    }

    /// Metadata row carrying only a name
    pub fn name(series: impl Into<String>) -> Self {
        Self {
            series: series.into(),
            time: None,
            values: Vec::new(),
        }
    }

    /// CSV line terminated by CRLF
    pub fn to_csv(&self) -> String {
        let mut line = self.series.clone();
        if let Some(ts) = self.time {
            line.push(',');
            line.push_str(&format_timestamp(ts));
        }
        for value in &self.values {
            line.push(',');
            match value {
                QueryValue::Null => {}
                QueryValue::Float(v) => line.push_str(&v.to_string()),
                QueryValue::String(s) => line.push_str(s),
            }
        }
        line.push_str("\r\n");
        line
    }
}

/// Query value types
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Null,
    Float(f64),
    String(String),
}

impl QueryValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            QueryValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, QueryValue::Null)
    }
}

impl From<crate::Value> for QueryValue {
    fn from(v: crate::Value) -> Self {
        match v {
            crate::Value::Float(f) => QueryValue::Float(f),
            crate::Value::Event(s) => QueryValue::String(s),
        }
    }
}

impl From<Option<f64>> for QueryValue {
    fn from(v: Option<f64>) -> Self {
        v.map_or(QueryValue::Null, QueryValue::Float)
    }
}

/// Receiver of result rows. Returning `false` stops the query.
pub trait RowSink {
    fn emit(&mut self, row: QueryRow) -> bool;
}

impl RowSink for Vec<QueryRow> {
    fn emit(&mut self, row: QueryRow) -> bool {
        self.push(row);
        true
    }
}
