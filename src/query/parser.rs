//! Query parser
//!
//! Queries arrive as JSON documents. The parser materializes the
//! document, validates every field (unknown tokens are errors), resolves
//! the selected series against the name registry, and produces a
//! `ParsedQuery` for the pipeline builder.
//!
//! Scan/aggregate grammar:
//!
//! ```json
//! {
//!   "select": "cpu",
//!   "range": { "from": 0, "to": 100 },
//!   "where": { "host": "a", "zone": ["eu", "us"] },
//!   "group-by": { "time": 10, "tag": ["host"] },
//!   "order-by": "time",
//!   "apply": [ { "name": "mean" } ]
//! }
//! ```
//!
//! Suggest and search use the metadata grammar:
//!
//! ```json
//! { "select": "metric-names", "starts-with": "cp" }
//! { "select": "series", "starts-with": "cpu", "where": { "host": "a", "zone": { "regex": "^eu" } } }
//! ```

use crate::query::ast::{
    AggregateFunc, FilterOp, GroupBy, OpDescriptor, OrderBy, ParsedQuery, ReshapeRequest,
    Selection, TRANSIENT_ID_BASE,
};
use crate::query::error::{QueryError, QueryResult};
use crate::registry::{SearchPredicate, SeriesRegistry, TransientMatcher};
use crate::series::{ParamId, SeriesName, Timestamp};
use serde_json::Value;
use std::collections::HashMap;

/// Tag constraint from the `where` clause.
enum TagMatch {
    Equals(String),
    OneOf(Vec<String>),
}

impl TagMatch {
    fn matches(&self, value: &str) -> bool {
        match self {
            TagMatch::Equals(v) => v == value,
            TagMatch::OneOf(vs) => vs.iter().any(|v| v == value),
        }
    }
}

fn parse_document(text: &str) -> QueryResult<serde_json::Map<String, Value>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| QueryError::at(format!("line {} column {}", e.line(), e.column()), e.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(QueryError::at("$", "query must be a JSON object")),
    }
}

fn expect_str<'a>(value: &'a Value, location: &str) -> QueryResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| QueryError::at(location, "expected a string"))
}

fn expect_u64(value: &Value, location: &str) -> QueryResult<u64> {
    value
        .as_u64()
        .ok_or_else(|| QueryError::at(location, "expected a non-negative integer"))
}

fn parse_where(value: &Value) -> QueryResult<Vec<(String, TagMatch)>> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::at("where", "expected an object of tag constraints"))?;
    let mut out = Vec::new();
    for (key, constraint) in obj {
        let m = match constraint {
            Value::String(s) => TagMatch::Equals(s.clone()),
            Value::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(expect_str(item, &format!("where.{}", key))?.to_string());
                }
                TagMatch::OneOf(values)
            }
            _ => {
                return Err(QueryError::at(
                    format!("where.{}", key),
                    "expected a string or an array of strings",
                ))
            }
        };
        out.push((key.clone(), m));
    }
    Ok(out)
}

/// Resolve the selected metric and tag constraints against the registry.
/// Returns matching `(id, parsed name)` pairs sorted by canonical name.
fn resolve_selection(
    registry: &SeriesRegistry,
    metric: &str,
    constraints: &[(String, TagMatch)],
) -> Vec<(ParamId, SeriesName)> {
    let mut out: Vec<(ParamId, String, SeriesName)> = registry
        .snapshot()
        .into_iter()
        .filter_map(|(id, name)| {
            let parsed = SeriesName::parse(&name).ok()?;
            if parsed.metric != metric {
                return None;
            }
            for (key, m) in constraints {
                match parsed.tag(key) {
                    Some(v) if m.matches(v) => {}
                    _ => return None,
                }
            }
            Some((id, name, parsed))
        })
        .collect();
    out.sort_by(|a, b| a.1.cmp(&b.1));
    out.into_iter().map(|(id, _, parsed)| (id, parsed)).collect()
}

fn parse_group_by(
    value: &Value,
    selected: &[(ParamId, SeriesName)],
) -> QueryResult<(Option<Timestamp>, GroupBy, Option<TransientMatcher>)> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::at("group-by", "expected an object"))?;

    let mut step = None;
    let mut group_by = GroupBy::default();
    let mut matcher = None;

    for (key, v) in obj {
        match key.as_str() {
            "time" => {
                let s = expect_u64(v, "group-by.time")?;
                if s == 0 {
                    return Err(QueryError::at("group-by.time", "step must be positive"));
                }
                step = Some(s);
            }
            "tag" => {
                let tags: Vec<String> = match v {
                    Value::String(s) => vec![s.clone()],
                    Value::Array(items) => {
                        let mut out = Vec::with_capacity(items.len());
                        for item in items {
                            out.push(expect_str(item, "group-by.tag")?.to_string());
                        }
                        out
                    }
                    _ => {
                        return Err(QueryError::at(
                            "group-by.tag",
                            "expected a tag name or an array of tag names",
                        ))
                    }
                };

                // Collapse each selected series onto its grouped label
                // and hand the labels to a transient matcher.
                let mut by_label: HashMap<String, ParamId> = HashMap::new();
                let mut trans = TransientMatcher::new();
                let mut next = TRANSIENT_ID_BASE;
                for (id, parsed) in selected {
                    let grouped = SeriesName {
                        metric: parsed.metric.clone(),
                        tags: parsed
                            .tags
                            .iter()
                            .filter(|(k, _)| tags.contains(k))
                            .cloned()
                            .collect(),
                    };
                    let label = grouped.canonical();
                    let tid = *by_label.entry(label.clone()).or_insert_with(|| {
                        let tid = next;
                        next += 1;
                        trans.insert(tid, label);
                        tid
                    });
                    group_by.transient_map.insert(*id, tid);
                }
                group_by.enabled = true;
                matcher = Some(trans);
            }
            other => return Err(QueryError::at(format!("group-by.{}", other), "unknown field")),
        }
    }
    Ok((step, group_by, matcher))
}

fn parse_apply(value: &Value) -> QueryResult<Vec<OpDescriptor>> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::at("apply", "expected an array of operators"))?;
    let mut ops = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let location = format!("apply[{}]", i);
        let obj = item
            .as_object()
            .ok_or_else(|| QueryError::at(location.clone(), "expected an operator object"))?;
        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| QueryError::at(location.clone(), "operator needs a 'name'"))?;
        let op = match name {
            "filter" => {
                let op_tok = obj
                    .get("op")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| QueryError::at(location.clone(), "filter needs an 'op'"))?;
                let op = FilterOp::from_token(op_tok).ok_or_else(|| {
                    QueryError::at(format!("{}.op", location), format!("unknown operator '{}'", op_tok))
                })?;
                let value = obj
                    .get("value")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| QueryError::at(location.clone(), "filter needs a numeric 'value'"))?;
                OpDescriptor::Filter { op, value }
            }
            "derivative" => OpDescriptor::Derivative,
            other => match AggregateFunc::from_token(other) {
                Some(func) => OpDescriptor::Aggregate { func },
                None => {
                    return Err(QueryError::at(
                        format!("{}.name", location),
                        format!("unknown operator '{}'", other),
                    ))
                }
            },
        };
        ops.push(op);
    }
    Ok(ops)
}

/// Parse a scan/aggregate query.
pub fn parse_query(registry: &SeriesRegistry, text: &str) -> QueryResult<ParsedQuery> {
    let doc = parse_document(text)?;

    let mut metric = None;
    let mut begin: Timestamp = 0;
    let mut end: Timestamp = Timestamp::MAX;
    let mut constraints = Vec::new();
    let mut order_by = OrderBy::Series;
    let mut group_by_value = None;
    let mut apply_value = None;

    for (key, value) in &doc {
        match key.as_str() {
            "select" => metric = Some(expect_str(value, "select")?.to_string()),
            "range" => {
                let obj = value
                    .as_object()
                    .ok_or_else(|| QueryError::at("range", "expected an object"))?;
                for (k, v) in obj {
                    match k.as_str() {
                        "from" => begin = expect_u64(v, "range.from")?,
                        "to" => end = expect_u64(v, "range.to")?,
                        other => {
                            return Err(QueryError::at(format!("range.{}", other), "unknown field"))
                        }
                    }
                }
            }
            "where" => constraints = parse_where(value)?,
            "order-by" => {
                order_by = match expect_str(value, "order-by")? {
                    "time" => OrderBy::Time,
                    "series" => OrderBy::Series,
                    other => {
                        return Err(QueryError::at(
                            "order-by",
                            format!("expected 'time' or 'series', got '{}'", other),
                        ))
                    }
                }
            }
            "group-by" => group_by_value = Some(value),
            "apply" => apply_value = Some(value),
            other => return Err(QueryError::at(other, "unknown field")),
        }
    }

    let metric = metric.ok_or_else(|| QueryError::at("select", "missing"))?;
    let selected = resolve_selection(registry, &metric, &constraints);
    if selected.is_empty() {
        return Err(QueryError::NoMatch(metric));
    }

    let (step, group_by, matcher) = match group_by_value {
        Some(v) => parse_group_by(v, &selected)?,
        None => (None, GroupBy::default(), None),
    };

    // The tag rewrite sits closest to the source, ahead of time
    // bucketing and the user-listed operators.
    let mut ops = Vec::new();
    if group_by.enabled {
        ops.push(OpDescriptor::GroupByTag);
    }
    if let Some(step) = step {
        ops.push(OpDescriptor::GroupByTime { step });
    }
    if let Some(v) = apply_value {
        ops.extend(parse_apply(v)?);
    }

    Ok(ParsedQuery::Scan {
        request: ReshapeRequest {
            select: Selection {
                ids: selected.iter().map(|(id, _)| *id).collect(),
                begin,
                end,
            },
            group_by,
            order_by,
        },
        ops,
        matcher,
    })
}

fn parse_tag_predicates(value: &Value) -> QueryResult<Vec<SearchPredicate>> {
    let obj = value
        .as_object()
        .ok_or_else(|| QueryError::at("where", "expected an object of tag constraints"))?;
    let mut out = Vec::new();
    for (key, constraint) in obj {
        match constraint {
            Value::String(s) => out.push(SearchPredicate::TagEquals {
                key: key.clone(),
                value: s.clone(),
            }),
            Value::Object(inner) => {
                let pattern = inner
                    .get("regex")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        QueryError::at(format!("where.{}", key), "expected {\"regex\": ...}")
                    })?;
                let pattern = regex::Regex::new(pattern).map_err(|e| {
                    QueryError::at(format!("where.{}", key), format!("bad regex: {}", e))
                })?;
                out.push(SearchPredicate::TagRegex {
                    key: key.clone(),
                    pattern,
                });
            }
            _ => {
                return Err(QueryError::at(
                    format!("where.{}", key),
                    "expected a string or {\"regex\": ...}",
                ))
            }
        }
    }
    Ok(out)
}

/// Parse a suggest or search query into a metadata predicate.
pub fn parse_metadata_query(text: &str) -> QueryResult<ParsedQuery> {
    let doc = parse_document(text)?;

    let select = doc
        .get("select")
        .and_then(|v| v.as_str())
        .ok_or_else(|| QueryError::at("select", "missing"))?;

    let mut preds = Vec::new();
    match select {
        "metric-names" => {
            for (key, value) in &doc {
                match key.as_str() {
                    "select" => {}
                    "starts-with" => preds.push(SearchPredicate::MetricStartsWith(
                        expect_str(value, "starts-with")?.to_string(),
                    )),
                    other => return Err(QueryError::at(other, "unknown field")),
                }
            }
        }
        "series" => {
            for (key, value) in &doc {
                match key.as_str() {
                    "select" => {}
                    "starts-with" => preds.push(SearchPredicate::MetricStartsWith(
                        expect_str(value, "starts-with")?.to_string(),
                    )),
                    "where" => preds.extend(parse_tag_predicates(value)?),
                    other => return Err(QueryError::at(other, "unknown field")),
                }
            }
        }
        other => {
            return Err(QueryError::at(
                "select",
                format!("expected 'metric-names' or 'series', got '{}'", other),
            ))
        }
    }

    let predicate = match preds.len() {
        0 => SearchPredicate::MetricStartsWith(String::new()),
        1 => preds.into_iter().next().unwrap(),
        _ => SearchPredicate::All(preds),
    };
    Ok(ParsedQuery::Metadata { predicate })
}
