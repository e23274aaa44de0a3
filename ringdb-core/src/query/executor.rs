//! Query executor
//!
//! Executes query plans against a storage snapshot and pushes CSV rows
//! into a [`RowSink`]. Streams are ranked by ascending series id forward
//! and descending id backward; that rank breaks timestamp ties. A backward
//! scan visits everything in exactly the reverse of the forward order.

use super::aggregates::{accumulator, Accumulator};
use super::apply::Pipeline;
use super::merge::Merge;
use super::planner::{JoinGroup, PlanKind, QueryPlan, QueryPlanner, Stream};
use super::sample::{Bucketer, Sampler};
use super::{OrderBy, QueryParser, QueryRow, QueryValue, RowSink, SampleSpec, ValueFilter};
use crate::storage::Storage;
use crate::{AggregateFunction, Direction, Result, Seq, SeriesId, TimeRange, Timestamp, Value};
use std::time::Instant;
use tracing::debug;

/// Query executor
pub struct QueryExecutor;

impl QueryExecutor {
    /// Parse, plan and execute a query document
    pub fn run(body: &str, storage: &Storage, sink: &mut dyn RowSink) -> Result<()> {
        let query = QueryParser::parse(body)?;
        let plan = QueryPlanner::plan(&query, storage.index())?;
        Self::execute(&plan, storage, sink)
    }

    /// Execute a plan. Stops quietly when the sink refuses a row.
    pub fn execute(plan: &QueryPlan, storage: &Storage, sink: &mut dyn RowSink) -> Result<()> {
        let start = Instant::now();
        let mut window = Window {
            sink,
            skip: plan.offset,
            remaining: plan.limit,
            emitted: 0,
        };
        {
            let mut pipeline = Pipeline::new(&plan.apply, &mut window);
            Self::dispatch(plan, storage, &mut pipeline);
            pipeline.finish();
        }

        debug!(
            "Query emitted {} rows in {:?}",
            window.emitted,
            start.elapsed()
        );
        Ok(())
    }

    fn dispatch(plan: &QueryPlan, storage: &Storage, sink: &mut dyn RowSink) {
        let scan = Scan {
            storage,
            range: plan.range,
            snapshot: storage.snapshot(),
            direction: plan.range.direction(),
        };

        match &plan.kind {
            PlanKind::Names(names) => {
                for name in names {
                    if !sink.emit(QueryRow::name(name.clone())) {
                        break;
                    }
                }
            }
            PlanKind::Select {
                streams,
                sample: None,
            } => scan.select(streams, plan.order_by, &plan.filter, sink),
            PlanKind::Select {
                streams,
                sample: Some((spec, step)),
            } => scan.sample(streams, *spec, *step, plan.order_by, &plan.filter, sink),
            PlanKind::Events(streams) => scan.select(streams, OrderBy::Time, &plan.filter, sink),
            PlanKind::Aggregate { streams, func } => scan.aggregate(streams, *func, &plan.filter, sink),
            PlanKind::GroupAggregate {
                streams,
                funcs,
                step,
            } => {
                let ranked = scan.ranked(streams);
                let names: Vec<&str> = ranked.iter().map(|s| s.name.as_str()).collect();
                let inputs = scan.inputs(&ranked);
                scan.bucketed(&names, &inputs, 1, funcs, *step, &plan.filter, sink)
            }
            PlanKind::Join(groups) => scan.join(groups, plan.order_by, &plan.filter, sink),
            PlanKind::GroupJoin {
                groups,
                funcs,
                step,
            } => {
                let ranked = scan.ranked(groups);
                let names: Vec<&str> = ranked.iter().map(|g| g.name.as_str()).collect();
                let inputs = join_inputs(&ranked);
                let slots = groups.first().map_or(0, |g| g.slots.len());
                scan.bucketed(&names, &inputs, slots, funcs, *step, &plan.filter, sink)
            }
        }
    }
}

/// Applies `offset` and `limit` in front of the real sink
struct Window<'a> {
    sink: &'a mut dyn RowSink,
    skip: usize,
    remaining: Option<usize>,
    emitted: usize,
}

impl RowSink for Window<'_> {
    fn emit(&mut self, row: QueryRow) -> bool {
        if self.skip > 0 {
            self.skip -= 1;
            return true;
        }
        match self.remaining.as_mut() {
            Some(0) => return false,
            Some(n) => *n -= 1,
            None => {}
        }
        if !self.sink.emit(row) {
            return false;
        }
        self.emitted += 1;
        self.remaining != Some(0)
    }
}

/// Ranked inputs: per rank, `(tag, series)` pairs in tie order
type Inputs = Vec<Vec<(usize, SeriesId)>>;

struct Scan<'a> {
    storage: &'a Storage,
    range: TimeRange,
    snapshot: Seq,
    direction: Direction,
}

impl Scan<'_> {
    fn backward(&self) -> bool {
        self.direction == Direction::Backward
    }

    fn ranked<'s, T>(&self, items: &'s [T]) -> Vec<&'s T> {
        let mut ranked: Vec<&T> = items.iter().collect();
        if self.backward() {
            ranked.reverse();
        }
        ranked
    }

    fn inputs(&self, ranked: &[&Stream]) -> Inputs {
        ranked
            .iter()
            .map(|stream| {
                let mut members: Vec<(usize, SeriesId)> =
                    stream.members.iter().map(|id| (0, *id)).collect();
                if self.backward() {
                    members.reverse();
                }
                members
            })
            .collect()
    }

    /// Walk all inputs in the requested order. `f` gets
    /// `(rank, tag, timestamp, value)` and returns `false` to stop.
    /// Returns `false` if stopped.
    fn scan(
        &self,
        inputs: &Inputs,
        order: OrderBy,
        f: &mut dyn FnMut(usize, usize, Timestamp, Value) -> bool,
    ) -> bool {
        match order {
            OrderBy::Time => {
                let mut owners = Vec::new();
                let mut cursors = Vec::new();
                for (rank, members) in inputs.iter().enumerate() {
                    for (tag, id) in members {
                        owners.push((rank, *tag));
                        cursors.push(self.storage.cursor(*id, self.range, self.snapshot));
                    }
                }
                for (input, ts, value) in Merge::new(cursors, self.direction) {
                    let (rank, tag) = owners[input];
                    if !f(rank, tag, ts, value) {
                        return false;
                    }
                }
            }
            OrderBy::Series => {
                for (rank, members) in inputs.iter().enumerate() {
                    let cursors = members
                        .iter()
                        .map(|(_, id)| self.storage.cursor(*id, self.range, self.snapshot))
                        .collect();
                    for (input, ts, value) in Merge::new(cursors, self.direction) {
                        if !f(rank, members[input].0, ts, value) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    fn select(&self, streams: &[Stream], order: OrderBy, filter: &ValueFilter, sink: &mut dyn RowSink) {
        let ranked = self.ranked(streams);
        let inputs = self.inputs(&ranked);
        self.scan(&inputs, order, &mut |rank, _, ts, value| {
            let value = QueryValue::from(value);
            if !filter.accepts_row(std::slice::from_ref(&value)) {
                return true;
            }
            sink.emit(QueryRow::new(ranked[rank].name.clone(), ts, vec![value]))
        });
    }

    fn sample(
        &self,
        streams: &[Stream],
        spec: SampleSpec,
        step: i64,
        order: OrderBy,
        filter: &ValueFilter,
        sink: &mut dyn RowSink,
    ) {
        let ranked = self.ranked(streams);
        let inputs = self.inputs(&ranked);
        let mut sampler = Sampler::new(spec, Bucketer::new(self.range, step), ranked.len());
        let mut out = Vec::new();
        let mut last_rank = None;

        let finished = self.scan(&inputs, order, &mut |rank, _, ts, value| {
            if order == OrderBy::Series && last_rank != Some(rank) {
                sampler.finish(&mut out);
                last_rank = Some(rank);
            }
            if let Some(v) = value.as_f64() {
                if filter.accepts(v) {
                    sampler.push(rank, ts, v, &mut out);
                }
            }
            drain(&mut out, &ranked, sink)
        });
        if finished {
            sampler.finish(&mut out);
            drain(&mut out, &ranked, sink);
        }
    }

    /// Streams in ascending id order regardless of direction. The row
    /// carries the timestamp of the last sample in scan direction.
    fn aggregate(
        &self,
        streams: &[Stream],
        func: AggregateFunction,
        filter: &ValueFilter,
        sink: &mut dyn RowSink,
    ) {
        for stream in streams {
            let mut acc = accumulator(func, self.direction);
            let mut last: Option<Timestamp> = None;
            let mut members = stream.members.clone();
            if self.backward() {
                members.reverse();
            }
            for id in &members {
                let Some(cursor) = self.storage.cursor(*id, self.range, self.snapshot) else {
                    continue;
                };
                for (ts, value) in cursor {
                    let Some(v) = value.as_f64() else {
                        continue;
                    };
                    acc.add(ts, v);
                    last = Some(match last {
                        Some(prev) if self.backward() => prev.min(ts),
                        Some(prev) => prev.max(ts),
                        None => ts,
                    });
                }
            }

            let (Some(ts), Some(result)) = (last, acc.result()) else {
                continue;
            };
            if !filter.accepts(result) {
                continue;
            }
            if !sink.emit(QueryRow::new(stream.name.clone(), ts, vec![QueryValue::Float(result)])) {
                return;
            }
        }
    }

    /// Group-aggregate over ranked outputs named `names`, each fed by
    /// `slots` inputs tagged with their slot
    #[allow(clippy::too_many_arguments)]
    fn bucketed(
        &self,
        names: &[&str],
        inputs: &Inputs,
        slots: usize,
        funcs: &[AggregateFunction],
        step: i64,
        filter: &ValueFilter,
        sink: &mut dyn RowSink,
    ) {
        let bucketer = Bucketer::closed(self.range, step);
        let mut buckets = Buckets::new(funcs, self.direction, names.len(), slots);
        let mut current: Option<i64> = None;

        let finished = self.scan(inputs, OrderBy::Time, &mut |rank, slot, ts, value| {
            let Some(v) = value.as_f64() else {
                return true;
            };
            let k = bucketer.index(ts);
            if current != Some(k) {
                if let Some(prev) = current {
                    if !buckets.flush(bucketer.stamp(prev), names, filter, sink) {
                        return false;
                    }
                }
                current = Some(k);
            }
            buckets.add(rank, slot, ts, v);
            true
        });
        if let (true, Some(prev)) = (finished, current) {
            buckets.flush(bucketer.stamp(prev), names, filter, sink);
        }
    }

    fn join(&self, groups: &[JoinGroup], order: OrderBy, filter: &ValueFilter, sink: &mut dyn RowSink) {
        let ranked = self.ranked(groups);
        let inputs = join_inputs(&ranked);

        let mut pending: Option<(usize, Timestamp, Vec<QueryValue>)> = None;
        let finished = self.scan(&inputs, order, &mut |rank, slot, ts, value| {
            if let Some((r, t, values)) = pending.as_mut() {
                if *r == rank && *t == ts && values[slot].is_null() {
                    values[slot] = value.into();
                    return true;
                }
            }
            let mut values = vec![QueryValue::Null; ranked[rank].slots.len()];
            values[slot] = value.into();
            match pending.replace((rank, ts, values)) {
                Some(row) => emit_join(row, &ranked, filter, sink),
                None => true,
            }
        });
        if let (true, Some(row)) = (finished, pending.take()) {
            emit_join(row, &ranked, filter, sink);
        }
    }
}

/// Per group, its filled slots tagged with their position
fn join_inputs(ranked: &[&JoinGroup]) -> Inputs {
    ranked
        .iter()
        .map(|group| {
            group
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, id)| id.map(|id| (slot, id)))
                .collect()
        })
        .collect()
}

fn drain(out: &mut Vec<(usize, Timestamp, QueryValue)>, ranked: &[&Stream], sink: &mut dyn RowSink) -> bool {
    for (rank, ts, value) in out.drain(..) {
        if !sink.emit(QueryRow::new(ranked[rank].name.clone(), ts, vec![value])) {
            return false;
        }
    }
    true
}

fn emit_join(
    (rank, ts, values): (usize, Timestamp, Vec<QueryValue>),
    ranked: &[&JoinGroup],
    filter: &ValueFilter,
    sink: &mut dyn RowSink,
) -> bool {
    if !filter.accepts_row(&values) {
        return true;
    }
    sink.emit(QueryRow::new(ranked[rank].name.clone(), ts, values))
}

/// Accumulators of the current bucket, per rank, slot and function
struct Buckets {
    accs: Vec<Vec<Vec<Box<dyn Accumulator>>>>,
    counts: Vec<usize>,
}

impl Buckets {
    fn new(funcs: &[AggregateFunction], direction: Direction, ranks: usize, slots: usize) -> Self {
        Self {
            accs: (0..ranks)
                .map(|_| {
                    (0..slots)
                        .map(|_| funcs.iter().map(|f| accumulator(*f, direction)).collect())
                        .collect()
                })
                .collect(),
            counts: vec![0; ranks],
        }
    }

    fn add(&mut self, rank: usize, slot: usize, ts: Timestamp, v: f64) {
        for acc in &mut self.accs[rank][slot] {
            acc.add(ts, v);
        }
        self.counts[rank] += 1;
    }

    /// Emit one row per non-empty rank, in rank order, and reset. Slots
    /// without samples in the bucket give empty values.
    fn flush(&mut self, stamp: Timestamp, names: &[&str], filter: &ValueFilter, sink: &mut dyn RowSink) -> bool {
        for (rank, slots) in self.accs.iter_mut().enumerate() {
            if self.counts[rank] == 0 {
                continue;
            }
            self.counts[rank] = 0;
            let values: Vec<QueryValue> = slots
                .iter()
                .flatten()
                .map(|acc| acc.result().into())
                .collect();
            for acc in slots.iter_mut().flatten() {
                acc.reset();
            }
            if filter.accepts_row(&values) && !sink.emit(QueryRow::new(names[rank], stamp, values)) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;
    use crate::{RingError, Sample, SeriesKey};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Arc<Storage> {
        let config = StorageConfig {
            data_dir: dir.path().join("db"),
            ..StorageConfig::test_defaults()
        };
        Storage::create(&config).unwrap();
        Storage::open(config).unwrap()
    }

    /// Series `test tag=A|B|C`, 100 samples each at `i * 1000` with value `i`
    fn loaded(dir: &TempDir) -> Arc<Storage> {
        let storage = open(dir);
        let ids: Vec<SeriesId> = ["A", "B", "C"]
            .iter()
            .map(|t| {
                storage
                    .series_id(&SeriesKey::new("test").with_tag("tag", *t))
                    .unwrap()
            })
            .collect();
        for i in 0..100i64 {
            for id in &ids {
                storage.write(&[Sample::new(*id, i * 1000, i as f64)]).unwrap();
            }
        }
        storage
    }

    fn run(storage: &Storage, body: &str) -> Result<Vec<QueryRow>> {
        let mut rows = Vec::new();
        QueryExecutor::run(body, storage, &mut rows)?;
        Ok(rows)
    }

    fn values(rows: &[QueryRow]) -> Vec<f64> {
        rows.iter().filter_map(|r| r.values[0].as_f64()).collect()
    }

    #[test]
    fn test_select_forward_and_backward() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);

        let rows = run(&storage, r#"{"select": "test", "range": {"from": 0, "to": 100000}}"#).unwrap();
        assert_eq!(rows.len(), 300);
        let names: Vec<&str> = rows[..4].iter().map(|r| r.series.as_str()).collect();
        assert_eq!(names, vec!["test tag=A", "test tag=B", "test tag=C", "test tag=A"]);
        assert_eq!(rows[3].time, Some(1000));

        let rows = run(&storage, r#"{"select": "test", "range": {"from": 99000, "to": -1}}"#).unwrap();
        assert_eq!(rows.len(), 300);
        assert_eq!(rows[0].series, "test tag=C");
        assert_eq!(rows[2].series, "test tag=A");
        assert_eq!(rows[0].time, Some(99000));
        assert_eq!(rows[299].time, Some(0));
    }

    #[test]
    fn test_order_by_series() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"select": "test", "order-by": "series", "range": {"from": 99000, "to": -1}}"#,
        )
        .unwrap();
        assert!(rows[..100].iter().all(|r| r.series == "test tag=C"));
        assert!(rows[200..].iter().all(|r| r.series == "test tag=A"));
        assert_eq!(values(&rows[..2]), vec![99.0, 98.0]);
    }

    #[test]
    fn test_aggregate() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        for range in [r#"{"from": 0, "to": 100000}"#, r#"{"from": 99000, "to": -1}"#] {
            let sum = run(&storage, &format!(r#"{{"aggregate": {{"test": "sum"}}, "range": {}}}"#, range)).unwrap();
            assert_eq!(values(&sum), vec![4950.0; 3]);
            assert_eq!(sum[0].series, "test:sum tag=A");
            assert_eq!(sum[2].series, "test:sum tag=C");

            let count =
                run(&storage, &format!(r#"{{"aggregate": {{"test": "count"}}, "range": {}}}"#, range)).unwrap();
            assert_eq!(values(&count), vec![100.0; 3]);
        }

        let grouped = run(
            &storage,
            r#"{"aggregate": {"test": "max"}, "group-by": ["missing"], "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[0].series, "test:max");
        assert_eq!(grouped[0].time, Some(99000));

        let empty = run(&storage, r#"{"aggregate": {"test": "sum"}, "range": {"from": 500000, "to": 600000}}"#).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_group_aggregate_buckets() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"group-aggregate": {"metric": "test", "func": ["count", "sum"], "step": "10us"},
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 30);
        assert!(rows.iter().all(|r| r.values[0] == QueryValue::Float(10.0)));
        assert_eq!(rows[0].series, "test:count|test:sum tag=A");
        assert_eq!(rows[0].values[1], QueryValue::Float(45.0));
        assert_eq!(rows[3].time, Some(10_000));

        let rows = run(
            &storage,
            r#"{"group-aggregate": {"metric": "test", "func": "count", "step": 10000},
                "range": {"from": 99999, "to": -1}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 30);
        assert_eq!(rows[0].series, "test:count tag=C");
        assert_eq!(rows[0].time, Some(99_999));
        assert_eq!(rows[3].time, Some(89_999));
    }

    #[test]
    fn test_group_aggregate_from_on_sample() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"group-aggregate": {"metric": "test", "func": "count", "step": 10000},
                "range": {"from": 99000, "to": -1000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 30);
        assert!(rows.iter().all(|r| r.values == vec![QueryValue::Float(10.0)]));
        assert!(rows.iter().all(|r| r.time.is_some_and(|ts| ts <= 99_000)));
        assert_eq!(rows[0].time, Some(99_000));
        assert_eq!(rows[29].time, Some(9_000));
    }

    #[test]
    fn test_edge_ties_agree_across_directions() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let id = storage.series_id(&SeriesKey::parse("dup host=A").unwrap()).unwrap();
        storage.write(&[Sample::new(id, 5000, 1.0)]).unwrap();
        storage.write(&[Sample::new(id, 5000, 2.0)]).unwrap();

        for range in [r#"{"from": 0, "to": 10000}"#, r#"{"from": 10000, "to": 0}"#] {
            let last = run(&storage, &format!(r#"{{"aggregate": {{"dup": "last"}}, "range": {}}}"#, range)).unwrap();
            assert_eq!(values(&last), vec![2.0], "range {}", range);
            let first = run(&storage, &format!(r#"{{"aggregate": {{"dup": "first"}}, "range": {}}}"#, range)).unwrap();
            assert_eq!(values(&first), vec![1.0], "range {}", range);

            let bucketed = run(
                &storage,
                &format!(
                    r#"{{"group-aggregate": {{"metric": "dup", "func": ["first", "last"], "step": 20000}}, "range": {}}}"#,
                    range
                ),
            )
            .unwrap();
            assert_eq!(bucketed[0].values, vec![QueryValue::Float(1.0), QueryValue::Float(2.0)]);
        }
    }

    /// `cpu.user host=A|B` holds `i` and `cpu.syst` holds `3 * i` at `i * 1000`
    fn cpu_pair(dir: &TempDir) -> Arc<Storage> {
        let storage = open(dir);
        for host in ["A", "B"] {
            let user = storage
                .series_id(&SeriesKey::parse(&format!("cpu.user host={}", host)).unwrap())
                .unwrap();
            let syst = storage
                .series_id(&SeriesKey::parse(&format!("cpu.syst host={}", host)).unwrap())
                .unwrap();
            for i in 0..10i64 {
                storage.write(&[Sample::new(user, i * 1000, i as f64)]).unwrap();
                storage.write(&[Sample::new(syst, i * 1000, 3.0 * i as f64)]).unwrap();
            }
        }
        storage
    }

    #[test]
    fn test_group_aggregate_join_with_eval() {
        let dir = TempDir::new().unwrap();
        let storage = cpu_pair(&dir);
        let query = |range: &str| {
            format!(
                r#"{{"group-aggregate": {{"metric": ["cpu.user", "cpu.syst"], "func": "max", "step": 1000}},
                    "where": {{"host": "A"}}, "range": {},
                    "apply": [{{"name": "eval2", "expr": "cpu.syst - 2 * cpu.user"}}]}}"#,
                range
            )
        };

        let rows = run(&storage, &query(r#"{"from": 0, "to": 11000}"#)).unwrap();
        assert_eq!(rows.len(), 10);
        for (k, row) in rows.iter().enumerate() {
            assert!(row.series.starts_with("cpu.user|cpu.syst"));
            assert_eq!(row.time, Some(k as i64 * 1000));
            assert_eq!(row.values, vec![QueryValue::Float(k as f64)]);
        }

        let rows = run(&storage, &query(r#"{"from": 9000, "to": -1000}"#)).unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].time, Some(9000));
        assert_eq!(rows[0].values, vec![QueryValue::Float(9.0)]);
        assert_eq!(rows[9].time, Some(0));
    }

    #[test]
    fn test_group_aggregate_join_columns() {
        let dir = TempDir::new().unwrap();
        let storage = cpu_pair(&dir);
        let rows = run(
            &storage,
            r#"{"group-aggregate": {"metric": ["cpu.user", "cpu.syst"], "func": ["min", "max"], "step": 2000},
                "range": {"from": 0, "to": 10000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(rows[0].series, "cpu.user:min|cpu.user:max|cpu.syst:min|cpu.syst:max host=A");
        assert_eq!(rows[1].series, "cpu.user:min|cpu.user:max|cpu.syst:min|cpu.syst:max host=B");
        assert_eq!(rows[2].time, Some(2000));
        assert_eq!(values_of(&rows[2]), vec![2.0, 3.0, 6.0, 9.0]);
    }

    fn values_of(row: &QueryRow) -> Vec<f64> {
        row.values.iter().filter_map(QueryValue::as_f64).collect()
    }

    #[test]
    fn test_apply_rate_and_top() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"select": "test", "where": {"tag": "A"}, "apply": [{"name": "rate"}],
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        // value grows by one every microsecond
        assert_eq!(rows.len(), 99);
        assert!(values(&rows).iter().all(|v| (v - 1e6).abs() < 1e-6));

        let rows = run(
            &storage,
            r#"{"select": "test", "apply": [{"name": "abs"}, {"name": "top", "N": 2}],
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].series, "test tag=A");
        assert_eq!(rows[1].series, "test tag=B");
        assert_eq!(rows[0].time, Some(99_000));
        // integral of i over 1us steps
        assert!((values(&rows)[0] - 4851e-6).abs() < 1e-12);

        let rows = run(
            &storage,
            r#"{"select": "test", "apply": [{"name": "top", "N": 3}], "offset": 1, "limit": 1,
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].series, "test tag=B");
    }

    #[test]
    fn test_apply_runs_after_filter() {
        let dir = TempDir::new().unwrap();
        let storage = cpu_pair(&dir);
        let rows = run(
            &storage,
            r#"{"join": ["cpu.user", "cpu.syst"], "where": {"host": "B"}, "filter": {"lt": 6},
                "apply": [{"name": "scale", "weights": [-1]}, {"name": "sum", "ignore_missing": true}],
                "range": {"from": 0, "to": 10000}}"#,
        )
        .unwrap();
        // rows with cpu.syst >= 6 are gone before scaling
        assert_eq!(values(&rows), vec![0.0, 2.0]);

        assert!(matches!(
            run(
                &storage,
                r#"{"join": ["cpu.user", "cpu.syst"], "apply": [{"name": "eval", "expr": "cpu.idle"}],
                    "range": {"from": 0, "to": 10000}}"#,
            ),
            Err(RingError::QueryParse(_))
        ));
    }

    #[test]
    fn test_join() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let cpu_a = storage.series_id(&SeriesKey::parse("cpu host=A").unwrap()).unwrap();
        let cpu_b = storage.series_id(&SeriesKey::parse("cpu host=B").unwrap()).unwrap();
        let mem_a = storage.series_id(&SeriesKey::parse("mem host=A").unwrap()).unwrap();
        for ts in 0..10i64 {
            storage.write(&[Sample::new(cpu_a, ts, ts as f64)]).unwrap();
            storage.write(&[Sample::new(cpu_b, ts, ts as f64)]).unwrap();
            if ts % 2 == 0 {
                storage.write(&[Sample::new(mem_a, ts, -(ts as f64) - 1.0)]).unwrap();
            }
        }

        let rows = run(&storage, r#"{"join": ["cpu", "mem"], "range": {"from": 0, "to": 10}}"#).unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows[0].to_csv(), "cpu|mem host=A,19700101T000000.000000000,0,-1\r\n");
        assert_eq!(rows[1].to_csv(), "cpu|mem host=B,19700101T000000.000000000,0,\r\n");
        assert_eq!(rows[2].values, vec![QueryValue::Float(1.0), QueryValue::Null]);
        assert_eq!(rows[4].values, vec![QueryValue::Float(2.0), QueryValue::Float(-3.0)]);

        let filtered = run(
            &storage,
            r#"{"join": ["cpu", "mem"], "where": {"host": "A"}, "filter": {"gt": -5},
                "range": {"from": 0, "to": 10}}"#,
        )
        .unwrap();
        // rows with mem <= -5 are dropped
        assert_eq!(filtered.len(), 7);

        assert!(matches!(
            run(&storage, r#"{"join": ["cpu", "nope"], "range": {"from": 0, "to": 10}}"#),
            Err(RingError::NotFound(_))
        ));
    }

    #[test]
    fn test_filter_is_open_interval() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"select": "test", "where": {"tag": "A"}, "filter": {"gt": 10, "lt": 20},
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(values(&rows), (11..20).map(|v| v as f64).collect::<Vec<_>>());
    }

    #[test]
    fn test_paa_complete_buckets_only() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);

        let rows = run(
            &storage,
            r#"{"select": "test", "where": {"tag": ["A", "B"]}, "group-by": {"time": "10us"},
                "sample": [{"name": "paa"}], "range": {"from": 100000, "to": 0}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 18);
        assert_eq!(rows[0].series, "test tag=B");
        assert_eq!(rows[0].time, Some(100_000));
        assert_eq!(rows[0].values, vec![QueryValue::Float(94.5)]);
        assert_eq!(rows[17].time, Some(20_000));

        let rows = run(
            &storage,
            r#"{"select": "test", "where": {"tag": ["A", "B"]}, "group-by": {"time": "10us"},
                "sample": [{"name": "max-paa"}], "range": {"from": 0, "to": 95000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 18);
        assert_eq!(rows[0].series, "test tag=A");
        assert_eq!(rows[0].values, vec![QueryValue::Float(9.0)]);
    }

    #[test]
    fn test_sax_words() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"select": "test", "group-by": {"time": "1us"},
                "sample": [{"name": "sax", "alphabet_size": "5", "window_width": "10"}],
                "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 30);
        assert!(rows
            .iter()
            .all(|r| r.values == vec![QueryValue::String("aabbccddee".into())]));
    }

    #[test]
    fn test_events() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir);
        let id = storage.series_id(&SeriesKey::parse("!alert sev=1").unwrap()).unwrap();
        for (ts, text) in [(1, "disk full"), (2, "cpu hot"), (3, "ok")] {
            storage.write(&[Sample::new(id, ts, text)]).unwrap();
        }
        let rows = run(&storage, r#"{"select-events": "!alert", "range": {"from": 10, "to": 0}}"#).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].to_csv(), "!alert sev=1,19700101T000000.000000003,ok\r\n");
    }

    #[test]
    fn test_limit_offset_and_names() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let rows = run(
            &storage,
            r#"{"select": "test", "offset": 5, "limit": 3, "range": {"from": 0, "to": 100000}}"#,
        )
        .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].series, "test tag=C");
        assert_eq!(rows[0].time, Some(1000));

        let names = run(&storage, r#"{"select": "meta:names"}"#).unwrap();
        let names: Vec<&str> = names.iter().map(|r| r.series.as_str()).collect();
        assert_eq!(names, vec!["test tag=A", "test tag=B", "test tag=C"]);
    }

    #[test]
    fn test_unknown_metric_and_empty_range() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        assert!(matches!(
            run(&storage, r#"{"select": "nope", "range": {"from": 0, "to": 10}}"#),
            Err(RingError::NotFound(_))
        ));
        assert!(run(&storage, r#"{"select": "test", "range": {"from": 200000, "to": 300000}}"#)
            .unwrap()
            .is_empty());
    }

    struct Stopper(usize);

    impl RowSink for Stopper {
        fn emit(&mut self, _row: QueryRow) -> bool {
            self.0 += 1;
            self.0 < 2
        }
    }

    #[test]
    fn test_sink_stops_scan() {
        let dir = TempDir::new().unwrap();
        let storage = loaded(&dir);
        let mut sink = Stopper(0);
        QueryExecutor::run(
            r#"{"select": "test", "range": {"from": 0, "to": 100000}}"#,
            &storage,
            &mut sink,
        )
        .unwrap();
        assert_eq!(sink.0, 2);
    }
}
