//! Grouping operations: aggregate, group, pivot and unpivot.
//!
//! Groups come out in order of first appearance.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use super::{key_of, AggregateFn, Aggregation, Record, TransformResult};
use crate::condition::FieldSource;
use crate::value::{as_number, compare, number, to_display_string};

/// Records bucketed by key, preserving first-appearance order.
fn buckets<'a>(records: &'a [Record], fields: &[String]) -> Vec<(Vec<String>, Vec<&'a Record>)> {
    let mut order: Vec<(Vec<String>, Vec<&Record>)> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    for record in records {
        let key = key_of(record, fields);
        match index.get(&key) {
            Some(&i) => order[i].1.push(record),
            None => {
                index.insert(key.clone(), order.len());
                order.push((key, vec![record]));
            }
        }
    }
    order
}

fn reduce(rows: &[&Record], field: Option<&str>, function: AggregateFn) -> Value {
    let values: Vec<&Value> = match field {
        Some(f) => rows.iter().filter_map(|r| r.field(f)).filter(|v| !v.is_null()).collect(),
        None => Vec::new(),
    };
    let numbers = || values.iter().filter_map(|v| as_number(v));

    match function {
        AggregateFn::Count => match field {
            Some(_) => Value::from(values.len()),
            None => Value::from(rows.len()),
        },
        AggregateFn::CountDistinct => {
            let distinct: HashSet<String> = values.iter().map(|v| to_display_string(v)).collect();
            Value::from(distinct.len())
        }
        AggregateFn::Sum => number(numbers().sum()),
        AggregateFn::Avg => {
            let (sum, n) = numbers().fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
            if n == 0 {
                Value::Null
            } else {
                number(sum / n as f64)
            }
        }
        AggregateFn::Min => values
            .iter()
            .min_by(|a, b| compare(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
        AggregateFn::Max => values
            .iter()
            .max_by(|a, b| compare(a, b))
            .map(|v| (*v).clone())
            .unwrap_or(Value::Null),
    }
}

/// One output record per group: the group-by fields plus one key per
/// aggregation. Without `group_by` a single-aggregation result is also
/// returned as the scalar.
pub(super) fn aggregate(
    records: &[Record],
    group_by: &[String],
    aggregations: &[Aggregation],
) -> TransformResult {
    let groups = if group_by.is_empty() {
        vec![(Vec::new(), records.iter().collect())]
    } else {
        buckets(records, group_by)
    };

    let mut out = Vec::with_capacity(groups.len());
    for (_, rows) in &groups {
        let mut row = Record::new();
        if let Some(first) = rows.first() {
            for field in group_by {
                row.insert(field.clone(), first.field(field).cloned().unwrap_or(Value::Null));
            }
        }
        for agg in aggregations {
            row.insert(
                agg.output_name(),
                reduce(rows, agg.field.as_deref(), agg.function),
            );
        }
        out.push(row);
    }

    let scalar = match (group_by.is_empty(), aggregations) {
        (true, [single]) => out.first().and_then(|r| r.get(&single.output_name()).cloned()),
        _ => None,
    };
    TransformResult {
        records: out,
        scalar,
    }
}

pub(super) fn group(records: Vec<Record>, key_fields: &[String], items_field: &str) -> Vec<Record> {
    buckets(&records, key_fields)
        .into_iter()
        .map(|(_, rows)| {
            let mut row = Record::new();
            for field in key_fields {
                row.insert(field.clone(), rows[0].field(field).cloned().unwrap_or(Value::Null));
            }
            row.insert("count".into(), Value::from(rows.len()));
            row.insert(
                items_field.to_string(),
                Value::Array(rows.iter().map(|r| Value::Object((*r).clone())).collect()),
            );
            row
        })
        .collect()
}

/// Spreadsheet-style pivot: one row per `row_fields` key, one column per
/// distinct `column_field` value, cells reduced with `function`.
pub(super) fn pivot(
    records: &[Record],
    row_fields: &[String],
    column_field: &str,
    value_field: &str,
    function: AggregateFn,
) -> Vec<Record> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        let col = record.field(column_field).map(to_display_string).unwrap_or_default();
        if !columns.contains(&col) {
            columns.push(col);
        }
    }

    buckets(records, row_fields)
        .into_iter()
        .map(|(_, rows)| {
            let mut row = Record::new();
            for field in row_fields {
                row.insert(field.clone(), rows[0].field(field).cloned().unwrap_or(Value::Null));
            }
            for col in &columns {
                let cell: Vec<&Record> = rows
                    .iter()
                    .copied()
                    .filter(|r| {
                        r.field(column_field).map(to_display_string).unwrap_or_default() == *col
                    })
                    .collect();
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    reduce(&cell, Some(value_field), function)
                };
                row.insert(col.clone(), value);
            }
            row
        })
        .collect()
}

pub(super) fn unpivot(
    records: &[Record],
    id_fields: &[String],
    value_fields: &[String],
    name_field: &str,
    value_name: &str,
) -> Vec<Record> {
    let mut out = Vec::new();
    for record in records {
        let melt: Vec<String> = if value_fields.is_empty() {
            record
                .keys()
                .filter(|k| !id_fields.contains(k))
                .cloned()
                .collect()
        } else {
            value_fields.to_vec()
        };
        for field in melt {
            let mut row = Record::new();
            for id in id_fields {
                row.insert(id.clone(), record.get(id).cloned().unwrap_or(Value::Null));
            }
            let value = record.get(&field).cloned().unwrap_or(Value::Null);
            row.insert(name_field.to_string(), Value::String(field));
            row.insert(value_name.to_string(), value);
            out.push(row);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(v: Value) -> Vec<Record> {
        crate::value::as_records(&v).unwrap()
    }

    fn agg(field: Option<&str>, function: AggregateFn, alias: Option<&str>) -> Aggregation {
        Aggregation {
            field: field.map(str::to_string),
            function,
            alias: alias.map(str::to_string),
        }
    }

    #[test]
    fn aggregate_by_group() {
        let input = rows(json!([
            { "team": "a", "pts": 3 }, { "team": "b", "pts": 5 },
            { "team": "a", "pts": 4 }, { "team": "a", "pts": null }
        ]));
        let res = aggregate(
            &input,
            &["team".to_string()],
            &[
                agg(None, AggregateFn::Count, Some("n")),
                agg(Some("pts"), AggregateFn::Sum, None),
                agg(Some("pts"), AggregateFn::Avg, Some("mean")),
                agg(Some("pts"), AggregateFn::Max, None),
            ],
        );
        assert_eq!(res.records.len(), 2);
        let a = &res.records[0];
        assert_eq!(a["team"], "a");
        assert_eq!(a["n"], 3);
        assert_eq!(a["sum_pts"], 7);
        assert_eq!(a["mean"], 3.5);
        assert_eq!(a["max_pts"], 4);
        assert!(res.scalar.is_none());
    }

    #[test]
    fn ungrouped_single_aggregation_yields_scalar() {
        let input = rows(json!([{ "v": "x" }, { "v": "y" }, { "v": "x" }]));
        let res = aggregate(&input, &[], &[agg(Some("v"), AggregateFn::CountDistinct, None)]);
        assert_eq!(res.scalar, Some(json!(2)));
    }

    #[test]
    fn group_collects_items() {
        let out = group(
            rows(json!([{ "k": 1, "v": "a" }, { "k": 2 }, { "k": 1, "v": "b" }])),
            &["k".to_string()],
            "items",
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["count"], 2);
        assert_eq!(out[0]["items"][1]["v"], "b");
    }

    #[test]
    fn pivot_then_unpivot() {
        let input = rows(json!([
            { "region": "n", "q": "q1", "sales": 10 },
            { "region": "n", "q": "q2", "sales": 5 },
            { "region": "s", "q": "q1", "sales": 7 },
            { "region": "n", "q": "q1", "sales": 1 }
        ]));
        let pivoted = pivot(&input, &["region".to_string()], "q", "sales", AggregateFn::Sum);
        assert_eq!(pivoted[0]["q1"], 11);
        assert_eq!(pivoted[0]["q2"], 5);
        assert_eq!(pivoted[1]["q2"], Value::Null);

        let melted = unpivot(
            &pivoted,
            &["region".to_string()],
            &["q1".to_string(), "q2".to_string()],
            "quarter",
            "sales",
        );
        assert_eq!(melted.len(), 4);
        assert_eq!(melted[1]["quarter"], "q2");
        assert_eq!(melted[1]["sales"], 5);
    }
}
