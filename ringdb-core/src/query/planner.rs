//! Query planner for RingDB
//!
//! Resolves the metrics of a parsed query against the series index and
//! groups the matching series into output streams.

use super::{ApplyStep, OrderBy, Query, QueryKind, SampleSpec, ValueFilter};
use crate::index::SeriesIndex;
use crate::{AggregateFunction, Result, SeriesId, SeriesKey, TimeRange};
use std::collections::BTreeMap;

/// Query execution plan
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub kind: PlanKind,
    pub range: TimeRange,
    pub filter: ValueFilter,
    /// Bound to this plan's columns
    pub apply: Vec<ApplyStep>,
    pub order_by: OrderBy,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// What to execute
#[derive(Debug, Clone)]
pub enum PlanKind {
    /// Metadata listing
    Names(Vec<String>),
    /// Raw samples, optionally sampled into buckets
    Select {
        streams: Vec<Stream>,
        sample: Option<(SampleSpec, i64)>,
    },
    /// Event payloads, ordered purely by time
    Events(Vec<Stream>),
    /// One row per stream
    Aggregate {
        streams: Vec<Stream>,
        func: AggregateFunction,
    },
    /// One row per stream and non-empty bucket
    GroupAggregate {
        streams: Vec<Stream>,
        funcs: Vec<AggregateFunction>,
        step: i64,
    },
    /// One row per tag set and timestamp
    Join(Vec<JoinGroup>),
    /// One row per tag set and non-empty bucket; values run metric by
    /// metric, function by function
    GroupJoin {
        groups: Vec<JoinGroup>,
        funcs: Vec<AggregateFunction>,
        step: i64,
    },
}

/// Output stream: one or more series reported under one name.
///
/// Members are in ascending id order; streams are ordered by their first
/// member.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub name: String,
    pub members: Vec<SeriesId>,
}

/// Series sharing one tag set, one slot per joined metric
#[derive(Debug, Clone, PartialEq)]
pub struct JoinGroup {
    pub name: String,
    pub slots: Vec<Option<SeriesId>>,
}

impl JoinGroup {
    fn first_id(&self) -> SeriesId {
        self.slots.iter().flatten().copied().min().unwrap_or(SeriesId::MAX)
    }
}

/// Query planner
pub struct QueryPlanner;

impl QueryPlanner {
    /// Build a plan; fails with `NotFound` when a queried metric is unknown
    pub fn plan(query: &Query, index: &SeriesIndex) -> Result<QueryPlan> {
        let columns = columns(&query.kind);
        let apply = ApplyStep::bind(&query.apply, &columns)?;
        let prefix = columns.join("|");

        let kind = match &query.kind {
            QueryKind::Names { metric } => PlanKind::Names(index.names(metric.as_deref())),
            QueryKind::Select { metric } => PlanKind::Select {
                streams: streams(query, index, metric, |key| key.canonical())?,
                sample: query.sample.zip(query.group_by.time),
            },
            QueryKind::SelectEvents { metric } => {
                PlanKind::Events(streams(query, index, metric, |key| key.canonical())?)
            }
            QueryKind::Aggregate { metric, func } => PlanKind::Aggregate {
                streams: streams(query, index, metric, |key| output_name(&prefix, key))?,
                func: *func,
            },
            QueryKind::GroupAggregate {
                metrics,
                funcs,
                step,
            } => match metrics.as_slice() {
                [metric] => PlanKind::GroupAggregate {
                    streams: streams(query, index, metric, |key| output_name(&prefix, key))?,
                    funcs: funcs.clone(),
                    step: *step,
                },
                _ => PlanKind::GroupJoin {
                    groups: join_groups(query, index, metrics, &prefix)?,
                    funcs: funcs.clone(),
                    step: *step,
                },
            },
            QueryKind::Join { metrics } => PlanKind::Join(join_groups(query, index, metrics, &prefix)?),
        };

        Ok(QueryPlan {
            kind,
            // metadata queries carry no range
            range: query.range.unwrap_or(TimeRange::new(0, 0)),
            filter: query.filter,
            apply,
            order_by: query.order_by,
            limit: query.limit,
            offset: query.offset,
        })
    }
}

/// Value columns of the rows a query produces, as `eval` names them
fn columns(kind: &QueryKind) -> Vec<String> {
    match kind {
        QueryKind::Names { .. } => Vec::new(),
        QueryKind::Select { metric } | QueryKind::SelectEvents { metric } => vec![metric.clone()],
        QueryKind::Aggregate { metric, func } => vec![format!("{}:{}", metric, func.name())],
        QueryKind::GroupAggregate { metrics, funcs, .. } => {
            if metrics.len() > 1 && funcs.len() == 1 {
                return metrics.clone();
            }
            metrics
                .iter()
                .flat_map(|m| funcs.iter().map(move |f| format!("{}:{}", m, f.name())))
                .collect()
        }
        QueryKind::Join { metrics } => metrics.clone(),
    }
}

/// `prefix tag=value ...`
fn output_name(prefix: &str, key: &SeriesKey) -> String {
    let tags = key.tag_line();
    if tags.is_empty() {
        prefix.to_string()
    } else {
        format!("{} {}", prefix, tags)
    }
}

/// Matching series of `metric`, grouped by the query's group-by tags
fn streams(
    query: &Query,
    index: &SeriesIndex,
    metric: &str,
    name: impl Fn(&SeriesKey) -> String,
) -> Result<Vec<Stream>> {
    let ids = index.resolve(metric, &query.tags)?;

    let mut out: Vec<Stream> = Vec::new();
    let mut by_name: BTreeMap<String, usize> = BTreeMap::new();
    for id in ids {
        let Some(key) = index.key(id) else {
            continue;
        };
        let key = if query.group_by.tags.is_empty() {
            key
        } else {
            key.project(&query.group_by.tags)
        };
        let name = name(&key);
        match by_name.get(&name) {
            Some(&pos) => out[pos].members.push(id),
            None => {
                by_name.insert(name.clone(), out.len());
                out.push(Stream {
                    name,
                    members: vec![id],
                });
            }
        }
    }
    Ok(out)
}

fn join_groups(
    query: &Query,
    index: &SeriesIndex,
    metrics: &[String],
    prefix: &str,
) -> Result<Vec<JoinGroup>> {
    let mut groups: BTreeMap<String, JoinGroup> = BTreeMap::new();

    for (slot, metric) in metrics.iter().enumerate() {
        for id in index.resolve(metric, &query.tags)? {
            let Some(key) = index.key(id) else {
                continue;
            };
            let group = groups.entry(key.tag_line()).or_insert_with(|| JoinGroup {
                name: output_name(prefix, &key),
                slots: vec![None; metrics.len()],
            });
            group.slots[slot] = Some(id);
        }
    }

    let mut out: Vec<JoinGroup> = groups.into_values().collect();
    out.sort_by_key(JoinGroup::first_id);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryParser, QueryValue};
    use crate::RingError;

    const RANGE: &str = r#""range": {"from": "20170101T000000", "to": "20170101T000010"}"#;

    fn index() -> SeriesIndex {
        let index = SeriesIndex::new();
        for name in [
            "cpu host=A dc=eu",
            "cpu host=B dc=eu",
            "cpu host=C dc=us",
            "mem host=A dc=eu",
            "mem host=C dc=us",
        ] {
            index.create(&SeriesKey::parse(name).unwrap());
        }
        index
    }

    fn plan(fields: &str) -> Result<QueryPlan> {
        let query = QueryParser::parse(&format!("{{{}, {}}}", fields, RANGE))?;
        QueryPlanner::plan(&query, &index())
    }

    #[test]
    fn test_select_streams() {
        let plan = plan(r#""select": "cpu", "where": {"dc": "eu"}"#).unwrap();
        let PlanKind::Select { streams, sample } = plan.kind else {
            panic!("expected select");
        };
        assert!(sample.is_none());
        assert_eq!(
            streams,
            vec![
                Stream {
                    name: "cpu dc=eu host=A".into(),
                    members: vec![1]
                },
                Stream {
                    name: "cpu dc=eu host=B".into(),
                    members: vec![2]
                },
            ]
        );
    }

    #[test]
    fn test_aggregate_group_by_names() {
        let grouped = plan(r#""aggregate": {"cpu": "max"}, "group-by": ["dc"]"#).unwrap();
        let PlanKind::Aggregate { streams, .. } = grouped.kind else {
            panic!("expected aggregate");
        };
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].name, "cpu:max dc=eu");
        assert_eq!(streams[0].members, vec![1, 2]);
        assert_eq!(streams[1].name, "cpu:max dc=us");

        let bucketed = plan(r#""group-aggregate": {"metric": "cpu", "func": ["min", "count"], "step": "1s"}"#)
            .unwrap();
        let PlanKind::GroupAggregate { streams, .. } = bucketed.kind else {
            panic!("expected group-aggregate");
        };
        assert_eq!(streams[2].name, "cpu:min|cpu:count dc=us host=C");
    }

    #[test]
    fn test_join_groups() {
        let plan = plan(r#""join": ["cpu", "mem"]"#).unwrap();
        let PlanKind::Join(groups) = plan.kind else {
            panic!("expected join");
        };
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].name, "cpu|mem dc=eu host=A");
        assert_eq!(groups[0].slots, vec![Some(1), Some(4)]);
        assert_eq!(groups[1].slots, vec![Some(2), None]);
    }

    #[test]
    fn test_multi_metric_group_aggregate() {
        let single = plan(r#""group-aggregate": {"metric": ["cpu", "mem"], "func": "max", "step": "1s"}"#)
            .unwrap();
        let PlanKind::GroupJoin { groups, .. } = single.kind else {
            panic!("expected group join");
        };
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].name, "cpu|mem dc=eu host=A");
        assert_eq!(groups[2].slots, vec![Some(3), Some(5)]);

        let several = plan(r#""group-aggregate": {"metric": ["cpu", "mem"], "func": ["min", "max"], "step": "1s"}"#)
            .unwrap();
        let PlanKind::GroupJoin { groups, .. } = several.kind else {
            panic!("expected group join");
        };
        assert_eq!(groups[0].name, "cpu:min|cpu:max|mem:min|mem:max dc=eu host=A");
    }

    #[test]
    fn test_apply_is_bound_to_columns() {
        let bound = plan(r#""join": ["cpu", "mem"], "apply": [{"name": "eval", "expr": "mem - cpu"}]"#).unwrap();
        let ApplyStep::Eval(expr) = &bound.apply[0] else {
            panic!("expected eval");
        };
        let values = [QueryValue::Float(1.0), QueryValue::Float(4.0)];
        assert_eq!(expr.eval(&values), Some(3.0));

        for fields in [
            r#""join": ["cpu", "mem"], "apply": [{"name": "eval", "expr": "disk"}]"#,
            r#""join": ["cpu", "mem"], "apply": [{"name": "top", "N": 1}]"#,
        ] {
            assert!(matches!(plan(fields), Err(RingError::QueryParse(_))), "accepted: {}", fields);
        }
        assert!(plan(r#""aggregate": {"cpu": "max"}, "apply": [{"name": "eval", "expr": "cpu:max * 2"}]"#).is_ok());
    }

    #[test]
    fn test_unknown_metric() {
        assert!(matches!(plan(r#""select": "disk""#), Err(RingError::NotFound(_))));
        assert!(matches!(
            plan(r#""join": ["cpu", "disk"]"#),
            Err(RingError::NotFound(_))
        ));
        // known metric, nothing matching is not an error
        let plan = plan(r#""select": "cpu", "where": {"dc": "mars"}"#).unwrap();
        assert!(matches!(plan.kind, PlanKind::Select { streams, .. } if streams.is_empty()));
    }
}
