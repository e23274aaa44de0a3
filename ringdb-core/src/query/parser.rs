//! JSON query parser
//!
//! Every failure is reported as `RingError::QueryParse`, so nothing is
//! streamed for a query that does not validate.

use super::{ApplyStep, Expr, GroupBy, OrderBy, PaaFunc, Query, QueryKind, SampleSpec, ValueFilter};
use crate::index::TagFilter;
use crate::time::{parse_duration, parse_timestamp};
use crate::{AggregateFunction, Result, RingError, TimeRange, Timestamp};
use serde_json::{Map, Value};

const VERBS: [&str; 5] = ["select", "select-events", "aggregate", "group-aggregate", "join"];

const OPTIONS: [&str; 9] = [
    "range", "where", "group-by", "order-by", "filter", "sample", "apply", "limit", "offset",
];

const NAMES_PREFIX: &str = "meta:names";

/// JSON query parser
pub struct QueryParser;

impl QueryParser {
    /// Parse a query document
    pub fn parse(body: &str) -> Result<Query> {
        let doc: Value = serde_json::from_str(body).map_err(|e| err(format!("invalid json: {}", e)))?;
        let obj = doc.as_object().ok_or_else(|| err("query must be an object"))?;

        for key in obj.keys() {
            if !VERBS.contains(&key.as_str()) && !OPTIONS.contains(&key.as_str()) && key != "output" {
                return Err(err(format!("unknown field `{}`", key)));
            }
        }

        let verbs: Vec<&str> = VERBS.iter().copied().filter(|v| obj.contains_key(*v)).collect();
        let verb = match verbs.as_slice() {
            [verb] => *verb,
            [] => return Err(err("no query verb")),
            _ => return Err(err("more than one query verb")),
        };
        let kind = parse_kind(verb, &obj[verb])?;

        let range = match obj.get("range") {
            Some(v) => Some(parse_range(v)?),
            None if matches!(kind, QueryKind::Names { .. }) => None,
            None => return Err(err("range is required")),
        };

        let group_by = obj.get("group-by").map(parse_group_by).transpose()?.unwrap_or_default();
        let sample = obj.get("sample").map(parse_sample).transpose()?;
        let apply = obj.get("apply").map(parse_apply).transpose()?.unwrap_or_default();

        let query = Query {
            range,
            tags: obj.get("where").map(parse_where).transpose()?.unwrap_or_default(),
            order_by: obj.get("order-by").map(parse_order_by).transpose()?.unwrap_or_default(),
            filter: obj.get("filter").map(parse_filter).transpose()?.unwrap_or_default(),
            limit: obj.get("limit").map(|v| parse_count(v, "limit")).transpose()?,
            offset: obj.get("offset").map(|v| parse_count(v, "offset")).transpose()?.unwrap_or(0),
            group_by,
            sample,
            apply,
            kind,
        };

        if let Some(output) = obj.get("output") {
            check_output(output)?;
        }
        validate(&query)?;
        Ok(query)
    }

    /// Parse a standalone `where` clause (used by series search)
    pub fn tag_filter(v: &Value) -> Result<TagFilter> {
        parse_where(v)
    }
}

fn err(msg: impl Into<String>) -> RingError {
    RingError::QueryParse(msg.into())
}

fn validate(query: &Query) -> Result<()> {
    if !query.apply.is_empty() {
        let textual = matches!(query.kind, QueryKind::Names { .. } | QueryKind::SelectEvents { .. })
            || matches!(query.sample, Some(SampleSpec::Sax { .. }));
        if textual {
            return Err(err("apply needs numeric rows"));
        }
    }
    match (&query.kind, query.sample.is_some(), query.group_by.time.is_some()) {
        (QueryKind::Select { .. }, true, false) => Err(err("sample requires group-by time")),
        (QueryKind::Select { .. }, false, true) => Err(err("group-by time requires sample")),
        (QueryKind::Select { .. }, _, _) => Ok(()),
        (_, true, _) => Err(err("sample is only supported by select")),
        (_, _, true) => Err(err("group-by time is only supported by select")),
        _ => Ok(()),
    }
}

fn parse_kind(verb: &str, v: &Value) -> Result<QueryKind> {
    match verb {
        "select" => {
            let name = metric_name(v, "select")?;
            if let Some(rest) = name.strip_prefix(NAMES_PREFIX) {
                return match rest {
                    "" => Ok(QueryKind::Names { metric: None }),
                    _ => match rest.strip_prefix(':') {
                        Some(metric) if !metric.is_empty() => Ok(QueryKind::Names {
                            metric: Some(metric.to_string()),
                        }),
                        _ => Err(err(format!("bad metadata query `{}`", name))),
                    },
                };
            }
            Ok(QueryKind::Select { metric: name })
        }
        "select-events" => {
            let metric = metric_name(v, "select-events")?;
            if !metric.starts_with('!') {
                return Err(err("event metrics start with `!`"));
            }
            Ok(QueryKind::SelectEvents { metric })
        }
        "aggregate" => {
            let obj = v.as_object().ok_or_else(|| err("aggregate must be an object"))?;
            if obj.len() != 1 {
                return Err(err("aggregate takes exactly one metric"));
            }
            let (metric, func) = obj.iter().next().ok_or_else(|| err("empty aggregate"))?;
            Ok(QueryKind::Aggregate {
                metric: metric.clone(),
                func: aggregate_function(func)?,
            })
        }
        "group-aggregate" => parse_group_aggregate(v),
        "join" => {
            let metrics = v
                .as_array()
                .ok_or_else(|| err("join takes a list of metrics"))?
                .iter()
                .map(|m| metric_name(m, "join"))
                .collect::<Result<Vec<_>>>()?;
            if metrics.is_empty() {
                return Err(err("join needs at least one metric"));
            }
            Ok(QueryKind::Join { metrics })
        }
        _ => Err(err(format!("unknown verb `{}`", verb))),
    }
}

fn parse_group_aggregate(v: &Value) -> Result<QueryKind> {
    let obj = v.as_object().ok_or_else(|| err("group-aggregate must be an object"))?;
    for key in obj.keys() {
        if !matches!(key.as_str(), "metric" | "func" | "step") {
            return Err(err(format!("unknown group-aggregate field `{}`", key)));
        }
    }

    let metrics = match obj.get("metric") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|m| metric_name(m, "metric"))
            .collect::<Result<Vec<_>>>()?,
        Some(single) => vec![metric_name(single, "metric")?],
        None => return Err(err("metric is required")),
    };
    if metrics.is_empty() {
        return Err(err("metric list is empty"));
    }
    let funcs = match obj.get("func") {
        Some(Value::Array(items)) => items.iter().map(aggregate_function).collect::<Result<Vec<_>>>()?,
        Some(single) => vec![aggregate_function(single)?],
        None => return Err(err("func is required")),
    };
    if funcs.is_empty() {
        return Err(err("func list is empty"));
    }
    let step = match obj.get("step") {
        Some(s) => duration(s)?,
        None => return Err(err("step is required")),
    };
    Ok(QueryKind::GroupAggregate { metrics, funcs, step })
}

fn metric_name(v: &Value, what: &str) -> Result<String> {
    match v.as_str() {
        Some(s) if !s.is_empty() => Ok(s.to_string()),
        _ => Err(err(format!("{} expects a metric name", what))),
    }
}

fn aggregate_function(v: &Value) -> Result<AggregateFunction> {
    let name = v.as_str().ok_or_else(|| err("function name must be a string"))?;
    AggregateFunction::from_name(name).ok_or_else(|| err(format!("unknown function `{}`", name)))
}

fn duration(v: &Value) -> Result<i64> {
    let step = match v {
        Value::String(s) => parse_duration(s).map_err(|e| err(e.to_string()))?,
        Value::Number(n) => n.as_i64().ok_or_else(|| err("bad step"))?,
        _ => return Err(err("bad step")),
    };
    if step <= 0 {
        return Err(err("step must be positive"));
    }
    Ok(step)
}

fn timestamp(v: &Value) -> Result<Timestamp> {
    match v {
        Value::String(s) => parse_timestamp(s).map_err(|e| err(e.to_string())),
        Value::Number(n) => n.as_i64().ok_or_else(|| err("bad timestamp")),
        _ => Err(err("bad timestamp")),
    }
}

fn parse_range(v: &Value) -> Result<TimeRange> {
    let obj = v.as_object().ok_or_else(|| err("range must be an object"))?;
    let from = timestamp(obj.get("from").ok_or_else(|| err("range.from is required"))?)?;
    let to = timestamp(obj.get("to").ok_or_else(|| err("range.to is required"))?)?;
    Ok(TimeRange::new(from, to))
}

fn tag_value(v: &Value) -> Result<String> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(err("tag values must be strings")),
    }
}

/// `{tag: value}` or `{tag: [values]}`
fn parse_where(v: &Value) -> Result<TagFilter> {
    let obj = v.as_object().ok_or_else(|| err("where must be an object"))?;
    let mut filter = TagFilter::new();
    for (tag, values) in obj {
        let values = match values {
            Value::Array(items) => items.iter().map(tag_value).collect::<Result<Vec<_>>>()?,
            single => vec![tag_value(single)?],
        };
        filter.insert(tag.clone(), values);
    }
    Ok(filter)
}

fn tag_names(v: &Value) -> Result<Vec<String>> {
    match v {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|t| {
                t.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| err("group-by tags must be strings"))
            })
            .collect(),
        _ => Err(err("bad group-by tag list")),
    }
}

/// `[tags]`, or `{time: step, tag: [tags]}`
fn parse_group_by(v: &Value) -> Result<GroupBy> {
    match v {
        Value::Array(_) => Ok(GroupBy {
            tags: tag_names(v)?,
            time: None,
        }),
        Value::Object(obj) => {
            let mut group_by = GroupBy::default();
            for (key, value) in obj {
                match key.as_str() {
                    "time" => group_by.time = Some(duration(value)?),
                    "tag" => group_by.tags = tag_names(value)?,
                    other => return Err(err(format!("unknown group-by field `{}`", other))),
                }
            }
            Ok(group_by)
        }
        _ => Err(err("bad group-by")),
    }
}

fn parse_order_by(v: &Value) -> Result<OrderBy> {
    match v.as_str() {
        Some("time") => Ok(OrderBy::Time),
        Some("series") => Ok(OrderBy::Series),
        _ => Err(err("order-by must be `time` or `series`")),
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_filter(v: &Value) -> Result<ValueFilter> {
    let obj = v.as_object().ok_or_else(|| err("filter must be an object"))?;
    let mut filter = ValueFilter::default();
    for (key, value) in obj {
        let threshold = number(value).ok_or_else(|| err(format!("bad `{}` threshold", key)))?;
        let slot = match key.as_str() {
            "gt" => &mut filter.gt,
            "lt" => &mut filter.lt,
            "ge" => &mut filter.ge,
            "le" => &mut filter.le,
            other => return Err(err(format!("unknown filter `{}`", other))),
        };
        *slot = Some(threshold);
    }
    if filter.is_empty() {
        return Err(err("empty filter"));
    }
    Ok(filter)
}

fn integer_param(obj: &Map<String, Value>, key: &str, min: usize, max: usize) -> Result<usize> {
    let v = obj.get(key).ok_or_else(|| err(format!("{} is required", key)))?;
    let n = match v {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .ok_or_else(|| err(format!("bad {}", key)))?;
    if n < min || n > max {
        return Err(err(format!("{} must be within {}..={}", key, min, max)));
    }
    Ok(n)
}

fn parse_sample(v: &Value) -> Result<SampleSpec> {
    let spec = match v {
        Value::Array(items) if items.len() == 1 => &items[0],
        Value::Object(_) => v,
        _ => return Err(err("sample takes exactly one transform")),
    };
    let obj = spec.as_object().ok_or_else(|| err("bad sample transform"))?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| err("sample name is required"))?;

    if name == "sax" {
        return Ok(SampleSpec::Sax {
            alphabet: integer_param(obj, "alphabet_size", 1, 20)?,
            window: integer_param(obj, "window_width", 4, 100)?,
        });
    }
    PaaFunc::from_name(name)
        .map(SampleSpec::Paa)
        .ok_or_else(|| err(format!("unknown sample transform `{}`", name)))
}

/// `[{"name": ..., params}]`, or a single step object
fn parse_apply(v: &Value) -> Result<Vec<ApplyStep>> {
    match v {
        Value::Array(items) => items.iter().map(apply_step).collect(),
        Value::Object(_) => Ok(vec![apply_step(v)?]),
        _ => Err(err("apply takes a list of steps")),
    }
}

fn apply_step(v: &Value) -> Result<ApplyStep> {
    let obj = v.as_object().ok_or_else(|| err("bad apply step"))?;
    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| err("apply step name is required"))?;
    let params: &[&str] = match name {
        "eval" | "eval2" => &["expr"],
        "scale" => &["weights"],
        "sum" => &["ignore_missing"],
        "top" => &["N"],
        _ => &[],
    };
    for key in obj.keys() {
        if key != "name" && !params.contains(&key.as_str()) {
            return Err(err(format!("unknown `{}` parameter `{}`", name, key)));
        }
    }

    match name {
        "eval" | "eval2" => {
            let expr = obj
                .get("expr")
                .and_then(Value::as_str)
                .ok_or_else(|| err("eval needs an `expr` string"))?;
            Ok(ApplyStep::Eval(Expr::parse(expr)?))
        }
        "rate" => Ok(ApplyStep::Rate),
        "abs" => Ok(ApplyStep::Abs),
        "scale" => {
            let weights = obj
                .get("weights")
                .and_then(Value::as_array)
                .ok_or_else(|| err("scale needs a `weights` list"))?
                .iter()
                .map(|w| number(w).ok_or_else(|| err("weights must be numbers")))
                .collect::<Result<Vec<_>>>()?;
            if weights.is_empty() {
                return Err(err("scale needs at least one weight"));
            }
            Ok(ApplyStep::Scale(weights))
        }
        "sum" => {
            let ignore_missing = match obj.get("ignore_missing") {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(_) => return Err(err("ignore_missing must be a boolean")),
            };
            Ok(ApplyStep::Sum { ignore_missing })
        }
        "top" => Ok(ApplyStep::Top(integer_param(obj, "N", 1, usize::MAX)?)),
        other => Err(err(format!("unknown apply step `{}`", other))),
    }
}

fn parse_count(v: &Value, what: &str) -> Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| err(format!("{} must be a non-negative integer", what)))
}

fn check_output(v: &Value) -> Result<()> {
    let obj = v.as_object().ok_or_else(|| err("output must be an object"))?;
    match obj.get("format").and_then(Value::as_str) {
        Some(f) if f.eq_ignore_ascii_case("csv") => Ok(()),
        None if obj.is_empty() => Ok(()),
        _ => Err(err("only csv output is supported")),
    }
}
