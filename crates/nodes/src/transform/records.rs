//! Row-wise operations: filter, sort, map, deduplicate, flatten, split and
//! expression.

use std::collections::HashMap;

use serde_json::Value;

use super::script::Script;
use super::{
    key_of, DedupStrategy, FieldMapping, FlattenMode, OutputType, Record, SortDirection,
    SortField, SplitMode,
};
use crate::condition::{ConditionGroup, FieldSource};
use crate::template;
use crate::value::{as_bool, as_number, compare, number, to_display_string};
use crate::NodeError;

pub(super) fn filter(records: Vec<Record>, group: &ConditionGroup) -> Result<Vec<Record>, NodeError> {
    let mut kept = Vec::with_capacity(records.len());
    for record in records {
        if group.evaluate(&record)? {
            kept.push(record);
        }
    }
    Ok(kept)
}

/// Stable multi-key sort; nulls and missing fields go last in either
/// direction.
pub(super) fn sort(mut records: Vec<Record>, fields: &[SortField]) -> Vec<Record> {
    let null = Value::Null;
    records.sort_by(|a, b| {
        for spec in fields {
            let left = a.field(&spec.field).unwrap_or(&null);
            let right = b.field(&spec.field).unwrap_or(&null);
            let ord = match (left.is_null(), right.is_null(), spec.direction) {
                (true, false, _) => std::cmp::Ordering::Greater,
                (false, true, _) => std::cmp::Ordering::Less,
                (_, _, SortDirection::Asc) => compare(left, right),
                (_, _, SortDirection::Desc) => compare(right, left),
            };
            if ord.is_ne() {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
    records
}

pub(super) fn map(records: Vec<Record>, mappings: &[FieldMapping], keep_unmapped: bool) -> Vec<Record> {
    records
        .into_iter()
        .map(|record| {
            let mut out = if keep_unmapped {
                let mut base = record.clone();
                for m in mappings {
                    base.remove(&m.source);
                }
                base
            } else {
                Record::new()
            };
            for m in mappings {
                let value = record.field(&m.source).cloned().unwrap_or(Value::Null);
                out.insert(m.target.clone(), value);
            }
            out
        })
        .collect()
}

/// Keep one record per key. The survivor takes the position of the key's
/// first occurrence, so the operation is idempotent.
pub(super) fn deduplicate(
    records: Vec<Record>,
    key_fields: &[String],
    strategy: DedupStrategy,
    compare_field: Option<&str>,
) -> Vec<Record> {
    let mut slots: Vec<Record> = Vec::new();
    let mut index: HashMap<Vec<String>, usize> = HashMap::new();
    let null = Value::Null;

    for record in records {
        let key = key_of(&record, key_fields);
        let Some(&slot) = index.get(&key) else {
            index.insert(key, slots.len());
            slots.push(record);
            continue;
        };
        let replace = match strategy {
            DedupStrategy::First => false,
            DedupStrategy::Last => true,
            DedupStrategy::Max | DedupStrategy::Min => {
                let field = compare_field.unwrap_or_default();
                let current = slots[slot].field(field).unwrap_or(&null);
                let candidate = record.field(field).unwrap_or(&null);
                match strategy {
                    DedupStrategy::Max => {
                        !candidate.is_null()
                            && (current.is_null() || compare(candidate, current).is_gt())
                    }
                    _ => compare(candidate, current).is_lt(),
                }
            }
        };
        if replace {
            slots[slot] = record;
        }
    }
    slots
}

pub(super) fn flatten(
    records: Vec<Record>,
    field: &str,
    mode: FlattenMode,
    separator: &str,
    prefix: bool,
) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        match (mode, record.get(field)) {
            (FlattenMode::Expand, Some(Value::Array(items))) => {
                for item in items.clone() {
                    let mut row = record.clone();
                    row.insert(field.to_string(), item);
                    out.push(row);
                }
            }
            (FlattenMode::Extract, Some(Value::Object(nested))) => {
                let nested = nested.clone();
                let mut row = record;
                row.remove(field);
                for (k, v) in nested {
                    let name = if prefix {
                        format!("{field}{separator}{k}")
                    } else {
                        k
                    };
                    row.insert(name, v);
                }
                out.push(row);
            }
            _ => out.push(record),
        }
    }
    out
}

pub(super) fn split(
    records: Vec<Record>,
    field: &str,
    delimiter: &str,
    mode: SplitMode,
    target: &str,
) -> Vec<Record> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let Some(Value::String(text)) = record.get(field) else {
            out.push(record);
            continue;
        };
        let pieces: Vec<Value> = text
            .split(delimiter)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| Value::String(p.to_string()))
            .collect();
        match mode {
            SplitMode::Array => {
                let mut row = record;
                row.insert(target.to_string(), Value::Array(pieces));
                out.push(row);
            }
            SplitMode::Expand => {
                for piece in pieces {
                    let mut row = record.clone();
                    row.insert(target.to_string(), piece);
                    out.push(row);
                }
            }
        }
    }
    out
}

/// Evaluate `expression` per record. A `{{field}}` template renders as a
/// string; anything else is a Rhai expression over the record's fields.
pub(super) fn expression(
    records: Vec<Record>,
    expression: &str,
    target: &str,
    output: OutputType,
) -> Result<Vec<Record>, NodeError> {
    let script = if template::is_template(expression) {
        None
    } else {
        Some(Script::compile(expression)?)
    };

    let mut out = Vec::with_capacity(records.len());
    for mut record in records {
        let raw = match &script {
            Some(script) => script.eval(&record)?,
            None => Value::String(template::render(expression, &record)),
        };
        record.insert(target.to_string(), coerce(raw, output)?);
        out.push(record);
    }
    Ok(out)
}

fn coerce(value: Value, output: OutputType) -> Result<Value, NodeError> {
    let mismatch = |what: &str, v: &Value| {
        NodeError::TypeMismatch(format!("expression result {v} is not {what}"))
    };
    match output {
        OutputType::String => Ok(Value::String(to_display_string(&value))),
        OutputType::Number => as_number(&value)
            .map(number)
            .ok_or_else(|| mismatch("a number", &value)),
        OutputType::Boolean => as_bool(&value)
            .map(Value::Bool)
            .ok_or_else(|| mismatch("a boolean", &value)),
        OutputType::Object | OutputType::Array => {
            let parsed = match &value {
                Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
                other => other.clone(),
            };
            let ok = match output {
                OutputType::Object => parsed.is_object(),
                _ => parsed.is_array(),
            };
            if ok {
                Ok(parsed)
            } else {
                Err(mismatch(
                    if output == OutputType::Object { "an object" } else { "an array" },
                    &value,
                ))
            }
        }
    }
}
