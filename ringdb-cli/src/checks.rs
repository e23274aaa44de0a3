//! Functional check suite run against a freshly created daemon
//!
//! The suite loads a small data set through the TCP port and verifies the
//! query API end to end: raw reads in both directions, tag filtering and
//! grouping, aggregation, bucketing, joins, value filters, metadata,
//! late-write rejection and error replies.

use crate::client::{bulk_frame, parse_rows, sample_frame, Client, Row};
use crate::harness::{retry, TestRun};
use anyhow::{anyhow, bail, ensure, Result};
use rand::seq::SliceRandom;
use ringdb_core::time::format_timestamp;
use ringdb_core::Timestamp;
use serde_json::{json, Value};
use std::time::Duration;

const TAG2: [&str; 2] = ["B", "C"];
const TAG3: [&str; 5] = ["D", "E", "F", "G", "H"];

/// `n` samples of metric `test`, one every `delta` ns, value `i` for
/// sample `i`, spread round robin over ten tag combinations
#[derive(Debug, Clone, Copy)]
pub struct Dataset {
    pub start: Timestamp,
    pub delta: i64,
    pub n: usize,
}

impl Dataset {
    /// One hour in the past, so late writes can be provoked
    pub fn new(n: usize) -> Self {
        let hour_ago = chrono::Utc::now().timestamp() - 3600;
        Self {
            start: hour_ago * 1_000_000_000,
            delta: 1_000_000,
            n,
        }
    }

    pub fn ts(&self, i: usize) -> Timestamp {
        self.start + i as i64 * self.delta
    }

    pub fn tags(&self, i: usize) -> String {
        format!("tag1=A tag2={} tag3={}", TAG2[i % 2], TAG3[i % 5])
    }

    pub fn series(&self, i: usize) -> String {
        format!("test {}", self.tags(i))
    }

    /// Distinct series, sorted by name
    pub fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = (0..10).map(|i| self.series(i)).collect();
        names.sort();
        names
    }

    fn frames(&self) -> String {
        (0..self.n)
            .map(|i| sample_frame(&self.series(i), self.ts(i), i as f64))
            .collect()
    }
}

fn range(from: Timestamp, to: Timestamp) -> Value {
    json!({"from": format_timestamp(from), "to": format_timestamp(to)})
}

fn with_range(mut query: Value, from: Timestamp, to: Timestamp) -> Value {
    query["range"] = range(from, to);
    query["output"] = json!({"format": "csv"});
    query
}

async fn rows(client: &Client, query: &Value) -> Result<Vec<Row>> {
    parse_rows(&client.query(query).await?)
}

/// Run every check and return the counters
pub async fn run_all(client: &Client, n: usize) -> TestRun {
    let mut run = TestRun::new();
    let data = Dataset::new(n);

    run.check("load data set", || load(client, &data)).await;
    run.check("read forward", || read_forward(client, &data)).await;
    run.check("read backward", || read_backward(client, &data)).await;
    run.check("group by tag backward", || group_by_backward(client, &data)).await;
    run.check("where clause", || where_clause(client, &data)).await;
    run.check("aggregate", || aggregate(client, &data)).await;
    run.check("group-aggregate forward", || group_aggregate(client, &data)).await;
    run.check("group-aggregate backward", || group_aggregate_backward(client, &data)).await;
    run.check("value filter", || value_filter(client, &data)).await;
    run.check("join bulk writes", || join(client, &data)).await;
    run.check("group-aggregate join with eval", || group_aggregate_join(client, &data)).await;
    run.check("metadata query", || metadata(client, &data)).await;
    run.check("late write", || late_write(client, &data)).await;
    run.check("error replies", || error_replies(client, &data)).await;
    run.check("suggest and search", || suggest_and_search(client, &data)).await;
    run.check("volume stats", || volume_stats(client)).await;

    run
}

async fn load(client: &Client, data: &Dataset) -> Result<()> {
    let reply = client.send(&data.frames()).await?;
    ensure!(reply.is_empty(), "unexpected reply: {}", reply.trim_end());

    // wait until every sample is visible
    let query = &with_range(json!({"aggregate": {"test": "count"}}), data.ts(0), data.ts(data.n));
    retry(
        || async move {
            let total: f64 = rows(client, query)
                .await?
                .iter()
                .map(|r| r.value(0))
                .sum::<Result<f64>>()?;
            if total as usize == data.n {
                Ok(())
            } else {
                Err(anyhow!("{} of {} samples visible", total, data.n))
            }
        },
        5,
        Duration::from_millis(200),
        2.0,
        |_| true,
    )
    .await
}

async fn read_forward(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(json!({"select": "test"}), data.ts(0), data.ts(data.n));
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == data.n, "expected {} rows, got {}", data.n, rows.len());

    for (i, row) in rows.iter().enumerate() {
        ensure!(row.series == data.series(i), "row {}: series {}", i, row.series);
        ensure!(row.timestamp == format_timestamp(data.ts(i)), "row {}: time {}", i, row.timestamp);
        ensure!(row.value(0)? == i as f64, "row {}: value {:?}", i, row.values);
    }
    Ok(())
}

async fn read_backward(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(json!({"select": "test"}), data.ts(data.n - 1), data.ts(0) - data.delta);
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == data.n, "expected {} rows, got {}", data.n, rows.len());

    for (k, row) in rows.iter().enumerate() {
        let i = data.n - 1 - k;
        ensure!(row.series == data.series(i), "row {}: series {}", k, row.series);
        ensure!(row.value(0)? == i as f64, "row {}: value {:?}", k, row.values);
    }
    Ok(())
}

async fn group_by_backward(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(
        json!({"select": "test", "group-by": ["tag3"]}),
        data.ts(data.n - 1),
        data.ts(0) - data.delta,
    );
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == data.n, "expected {} rows, got {}", data.n, rows.len());

    for (k, row) in rows.iter().enumerate() {
        let i = data.n - 1 - k;
        let expected = format!("test tag3={}", TAG3[i % 5]);
        ensure!(row.series == expected, "row {}: {} != {}", k, row.series, expected);
    }
    Ok(())
}

async fn where_clause(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(
        json!({"select": "test", "where": {"tag2": ["C"]}}),
        data.ts(data.n - 1),
        data.ts(0) - data.delta,
    );
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == data.n / 2, "expected {} rows, got {}", data.n / 2, rows.len());
    for row in &rows {
        ensure!(row.value(0)? as usize % 2 == 1, "even value in {:?}", row);
    }
    Ok(())
}

async fn aggregate(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(json!({"aggregate": {"test": "count"}}), data.ts(0), data.ts(data.n));
    let counts = rows(client, &query).await?;
    ensure!(counts.len() == 10, "expected 10 series, got {}", counts.len());
    for row in &counts {
        ensure!(row.series.starts_with("test:count "), "bad name {}", row.series);
        ensure!(row.value(0)? as usize == data.n / 10, "bad count in {:?}", row);
    }

    let query = with_range(
        json!({"aggregate": {"test": "sum"}, "group-by": ["tag1"]}),
        data.ts(0),
        data.ts(data.n),
    );
    let sums = rows(client, &query).await?;
    ensure!(sums.len() == 1, "expected one group, got {}", sums.len());
    let expected = (data.n * (data.n - 1) / 2) as f64;
    ensure!(sums[0].value(0)? == expected, "sum {:?} != {}", sums[0].values, expected);
    Ok(())
}

async fn group_aggregate(client: &Client, data: &Dataset) -> Result<()> {
    let steps = 10;
    let step_ns = data.n as i64 * data.delta / steps;
    let query = with_range(
        json!({"group-aggregate": {"metric": "test", "func": ["count"], "step": step_ns.to_string()}}),
        data.ts(0),
        data.ts(data.n),
    );
    let rows = rows(client, &query).await?;
    let expected_rows = 10 * steps as usize;
    ensure!(rows.len() == expected_rows, "expected {} rows, got {}", expected_rows, rows.len());

    let per_bucket = data.n / steps as usize / 10;
    for row in &rows {
        ensure!(row.value(0)? as usize == per_bucket, "bad count in {:?}", row);
    }
    Ok(())
}

/// Starts at the last sample, which must land in the first bucket
async fn group_aggregate_backward(client: &Client, data: &Dataset) -> Result<()> {
    let steps = 10;
    let step_ns = data.n as i64 * data.delta / steps;
    let from = data.ts(data.n - 1);
    let query = with_range(
        json!({"group-aggregate": {"metric": "test", "func": "count", "step": step_ns.to_string()}}),
        from,
        data.ts(0) - 1,
    );
    let rows = rows(client, &query).await?;
    let expected_rows = 10 * steps as usize;
    ensure!(rows.len() == expected_rows, "expected {} rows, got {}", expected_rows, rows.len());

    let per_bucket = data.n / steps as usize / 10;
    for row in &rows {
        ensure!(row.value(0)? as usize == per_bucket, "bad count in {:?}", row);
    }
    ensure!(rows[0].timestamp == format_timestamp(from), "first bucket at {}", rows[0].timestamp);
    Ok(())
}

async fn value_filter(client: &Client, data: &Dataset) -> Result<()> {
    let query = with_range(
        json!({"select": "test", "filter": {"gt": 100, "lt": 200}}),
        data.ts(0),
        data.ts(data.n),
    );
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == 99, "expected 99 rows, got {}", rows.len());
    ensure!(rows[0].value(0)? == 101.0, "first row {:?}", rows[0]);
    Ok(())
}

async fn join(client: &Client, data: &Dataset) -> Result<()> {
    let m = 100;
    let frames: String = (0..m)
        .map(|i| {
            let tags = format!("host=h{}", i % 2);
            bulk_frame(&["cpu", "mem"], &tags, data.ts(i), &[i as f64, (11 * i) as f64])
        })
        .collect();
    let reply = client.send(&frames).await?;
    ensure!(reply.is_empty(), "unexpected reply: {}", reply.trim_end());

    let query = &with_range(json!({"join": ["cpu", "mem"]}), data.ts(0), data.ts(m));
    let rows = retry(
        || async move {
            let rows = rows(client, query).await?;
            if rows.len() == m {
                Ok(rows)
            } else {
                Err(anyhow!("expected {} rows, got {}", m, rows.len()))
            }
        },
        5,
        Duration::from_millis(200),
        2.0,
        |_| true,
    )
    .await?;

    for (i, row) in rows.iter().enumerate() {
        let expected = format!("cpu|mem host=h{}", i % 2);
        ensure!(row.series == expected, "row {}: {}", i, row.series);
        ensure!(row.value(0)? == i as f64, "row {}: {:?}", i, row.values);
        ensure!(row.value(1)? == (11 * i) as f64, "row {}: {:?}", i, row.values);
    }
    Ok(())
}

/// Runs on the `cpu`/`mem` pairs written by the join check
async fn group_aggregate_join(client: &Client, data: &Dataset) -> Result<()> {
    let m = 100;
    let query = with_range(
        json!({
            "group-aggregate": {"metric": ["cpu", "mem"], "func": "max", "step": data.delta.to_string()},
            "where": {"host": "h0"},
            "apply": [{"name": "eval2", "expr": "mem - 11 * cpu"}]
        }),
        data.ts(0),
        data.ts(m),
    );
    let rows = rows(client, &query).await?;
    ensure!(rows.len() == m / 2, "expected {} rows, got {}", m / 2, rows.len());
    for (k, row) in rows.iter().enumerate() {
        ensure!(row.series.starts_with("cpu|mem"), "row {}: {}", k, row.series);
        ensure!(row.timestamp == format_timestamp(data.ts(2 * k)), "row {}: time {}", k, row.timestamp);
        ensure!(row.values.len() == 1 && row.value(0)? == 0.0, "row {}: {:?}", k, row.values);
    }
    Ok(())
}

async fn metadata(client: &Client, data: &Dataset) -> Result<()> {
    let names = client.query(&json!({"select": "meta:names:test"})).await?;
    let names: Vec<&str> = names.split_terminator("\r\n").collect();
    ensure!(names == data.series_names(), "unexpected names {:?}", names);

    // every combination of two tags, written in random order
    let mut combos: Vec<String> = (0..4)
        .flat_map(|a| (0..3).map(move |b| format!("meta.check rack=r{} slot=s{}", a, b)))
        .collect();
    combos.shuffle(&mut rand::thread_rng());
    let frames: String = combos
        .iter()
        .map(|series| sample_frame(series, data.ts(0), 1.0))
        .collect();
    let reply = client.send(&frames).await?;
    ensure!(reply.is_empty(), "unexpected reply: {}", reply.trim_end());

    combos.sort();
    let names = client.query(&json!({"select": "meta:names:meta.check"})).await?;
    let names: Vec<&str> = names.split_terminator("\r\n").collect();
    ensure!(names == combos, "expected {} sorted names, got {:?}", combos.len(), names);
    Ok(())
}

async fn late_write(client: &Client, data: &Dataset) -> Result<()> {
    let late = data.ts(0) - 3_600_000_000_000;
    let reply = client.send(&sample_frame(&data.series(0), late, -1.0)).await?;
    ensure!(reply == "-DB late write\r\n", "unexpected reply {:?}", reply);

    let query = with_range(json!({"select": "test"}), late - 1, data.ts(0));
    let rows = rows(client, &query).await?;
    ensure!(rows.is_empty(), "late sample became visible: {:?}", rows);
    Ok(())
}

async fn error_replies(client: &Client, data: &Dataset) -> Result<()> {
    let (from, to) = (data.ts(0), data.ts(data.n));
    let cases = [
        (with_range(json!({"select": "no.such.metric"}), from, to), "-not found\r\n"),
        (with_range(json!({"aggregate": {"no.such.metric": "max"}}), from, to), "-not found\r\n"),
        (with_range(json!({"join": ["test", "no.such.metric"]}), from, to), "-not found\r\n"),
        (with_range(json!({"select": "test", "frobnicate": true}), from, to), "-query parsing error\r\n"),
        (json!({"select": "test"}), "-query parsing error\r\n"),
        // nothing stored a year later
        (
            with_range(json!({"select": "test"}), to + 365 * 86_400_000_000_000, to + 366 * 86_400_000_000_000),
            "",
        ),
    ];
    for (query, expected) in cases {
        let body = client.query(&query).await?;
        if body != expected {
            bail!("query {} answered {:?}, expected {:?}", query, body, expected);
        }
    }
    Ok(())
}

async fn suggest_and_search(client: &Client, data: &Dataset) -> Result<()> {
    let body = client
        .post("/api/suggest", &json!({"select": "metric-names", "starts-with": "te"}))
        .await?;
    ensure!(body == "test\r\n", "suggest answered {:?}", body);

    let body = client
        .post("/api/suggest", &json!({"select": "tag-values", "metric": "test", "tag": "tag3"}))
        .await?;
    ensure!(body == "D\r\nE\r\nF\r\nG\r\nH\r\n", "suggest answered {:?}", body);

    let body = client
        .post("/api/search", &json!({"select": "test", "where": {"tag3": "D"}}))
        .await?;
    let expected: Vec<String> = data
        .series_names()
        .into_iter()
        .filter(|name| name.ends_with("tag3=D"))
        .collect();
    let names: Vec<&str> = body.split_terminator("\r\n").collect();
    ensure!(names == expected, "search answered {:?}", names);
    Ok(())
}

async fn volume_stats(client: &Client) -> Result<()> {
    let stats = client.stats().await?;
    let volume = stats
        .get("volume_0")
        .ok_or_else(|| anyhow!("no volume_0 in {}", stats))?;
    let free = volume["free_space"].as_u64().unwrap_or(u64::MAX);
    let capacity = volume["capacity"].as_u64().unwrap_or(0);
    ensure!(free <= capacity, "free space {} exceeds capacity {}", free, capacity);
    Ok(())
}
