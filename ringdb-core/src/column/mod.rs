//! Per-series column store
//!
//! Each series keeps its samples in a lock-free skip list keyed by
//! `(timestamp, seq)`, so equal timestamps stay in arrival order and
//! backward scans are plain reverse range walks. Readers only see samples
//! whose sequence number is at or below the snapshot they started with.

use crate::{DuplicatePolicy, Record, Seq, SeriesId, TimeRange, Timestamp, Value};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

/// Entries fetched per cursor refill
const CURSOR_BATCH: usize = 1024;

type Key = (Timestamp, Seq);

/// Samples of a single series
#[derive(Default)]
pub struct Column {
    data: SkipMap<Key, Value>,
}

impl Column {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ts: Timestamp, seq: Seq, value: Value, policy: DuplicatePolicy) {
        if policy == DuplicatePolicy::Overwrite {
            let stale: Vec<Key> = self
                .data
                .range((ts, 0)..=(ts, Seq::MAX))
                .map(|e| *e.key())
                .collect();
            for key in stale {
                self.data.remove(&key);
            }
        }
        self.data.insert((ts, seq), value);
    }

    pub fn remove(&self, ts: Timestamp, seq: Seq) {
        self.data.remove(&(ts, seq));
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// All columns, keyed by series id
#[derive(Default)]
pub struct ColumnStore {
    columns: RwLock<HashMap<SeriesId, Arc<Column>>>,
}

impl ColumnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, series: SeriesId) -> Option<Arc<Column>> {
        self.columns.read().get(&series).cloned()
    }

    fn get_or_create(&self, series: SeriesId) -> Arc<Column> {
        if let Some(column) = self.get(series) {
            return column;
        }
        self.columns
            .write()
            .entry(series)
            .or_insert_with(|| Arc::new(Column::new()))
            .clone()
    }

    pub fn insert(&self, record: &Record, policy: DuplicatePolicy) {
        self.get_or_create(record.series).insert(
            record.timestamp,
            record.seq,
            record.value.clone(),
            policy,
        );
    }

    /// Drop records whose on-disk copy was recycled
    pub fn evict(&self, records: &[Record]) {
        let columns = self.columns.read();
        for record in records {
            if let Some(column) = columns.get(&record.series) {
                column.remove(record.timestamp, record.seq);
            }
        }
    }

    /// Total samples held in memory
    pub fn total_samples(&self) -> usize {
        self.columns.read().values().map(|c| c.len()).sum()
    }

    /// Time-ordered cursor over one series; `None` if the series has no column
    pub fn cursor(&self, series: SeriesId, range: TimeRange, snapshot: Seq) -> Option<Cursor> {
        self.get(series).map(|column| Cursor::new(column, range, snapshot))
    }
}

/// Iterator over `(timestamp, value)` of one series in scan direction.
///
/// The cursor refills in batches by re-seeking past the last key it
/// returned, so it holds no borrow on the skip list between calls.
pub struct Cursor {
    column: Arc<Column>,
    lower: Bound<Key>,
    upper: Bound<Key>,
    backward: bool,
    snapshot: Seq,
    buffer: VecDeque<(Timestamp, Value)>,
    exhausted: bool,
}

impl Cursor {
    fn new(column: Arc<Column>, range: TimeRange, snapshot: Seq) -> Self {
        let (lower, upper) = range.key_bounds();
        Self {
            column,
            lower,
            upper,
            backward: range.direction() == crate::Direction::Backward,
            snapshot,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn refill(&mut self) {
        let range = (self.lower, self.upper);
        let mut last = None;
        let mut fetched = 0;

        let mut take = |key: Key, value: &Value| {
            if key.1 <= self.snapshot {
                self.buffer.push_back((key.0, value.clone()));
            }
            last = Some(key);
            fetched += 1;
        };

        if self.backward {
            for entry in self.column.data.range(range).rev().take(CURSOR_BATCH) {
                take(*entry.key(), entry.value());
            }
        } else {
            for entry in self.column.data.range(range).take(CURSOR_BATCH) {
                take(*entry.key(), entry.value());
            }
        }

        match last {
            Some(key) if fetched == CURSOR_BATCH => {
                if self.backward {
                    self.upper = Bound::Excluded(key);
                } else {
                    self.lower = Bound::Excluded(key);
                }
            }
            _ => self.exhausted = true,
        }
    }
}

impl Iterator for Cursor {
    type Item = (Timestamp, Value);

    fn next(&mut self) -> Option<Self::Item> {
        while self.buffer.is_empty() && !self.exhausted {
            self.refill();
        }
        self.buffer.pop_front()
    }
}
