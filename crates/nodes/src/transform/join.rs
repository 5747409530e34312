//! Lookup enrichment and two-source merge.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{key_of, ConflictPolicy, JoinType, Record};
use crate::condition::FieldSource;
use crate::transport::HttpMethod;
use crate::value::to_display_string;
use crate::NodeError;

/// Where `enrich` finds its lookup rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum LookupSource {
    /// A context key holding an array of rows or an object keyed by join
    /// value.
    Context { key: String },
    /// Rows given inline.
    Table { rows: Value },
    /// Rows fetched once per execution from an HTTP endpoint.
    External {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        /// Dotted path to the rows inside the response body.
        #[serde(default)]
        rows_path: Option<String>,
    },
}

/// What happens to a record whose join key has no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissPolicy {
    SkipRecord,
    #[default]
    NullFill,
    Error,
    DefaultValue,
}

pub(super) struct EnrichSpec<'a> {
    pub join_key: &'a str,
    pub lookup_key: &'a str,
    pub target_field: &'a str,
    pub value_field: Option<&'a str>,
    pub on_miss: MissPolicy,
    pub default_value: Option<&'a Value>,
}

fn index_table(table: &Value, lookup_key: &str) -> Result<HashMap<String, Value>, NodeError> {
    match table {
        Value::Array(rows) => Ok(rows
            .iter()
            .filter_map(|row| {
                row.field(lookup_key)
                    .map(|k| (to_display_string(k), row.clone()))
            })
            .collect()),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => Err(NodeError::TypeMismatch(format!(
            "lookup table must be an array or object, got {other}"
        ))),
    }
}

pub(super) fn enrich(
    records: Vec<Record>,
    table: &Value,
    spec: &EnrichSpec<'_>,
) -> Result<Vec<Record>, NodeError> {
    let index = index_table(table, spec.lookup_key)?;
    let mut out = Vec::with_capacity(records.len());

    for mut record in records {
        let key = record.field(spec.join_key).map(to_display_string);
        let hit = key.as_ref().and_then(|k| index.get(k));
        let value = match hit {
            Some(row) => match spec.value_field {
                Some(field) => row.field(field).cloned().unwrap_or(Value::Null),
                None => row.clone(),
            },
            None => match spec.on_miss {
                MissPolicy::SkipRecord => continue,
                MissPolicy::NullFill => Value::Null,
                MissPolicy::DefaultValue => spec.default_value.cloned().unwrap_or(Value::Null),
                MissPolicy::Error => {
                    return Err(NodeError::LookupMiss(format!(
                        "no lookup row for {} = '{}'",
                        spec.join_key,
                        key.as_deref().unwrap_or_default()
                    )))
                }
            },
        };
        record.insert(spec.target_field.to_string(), value);
        out.push(record);
    }
    Ok(out)
}

pub(super) struct MergeSpec<'a> {
    pub left_on: &'a [String],
    pub right_on: &'a [String],
    pub join: JoinType,
    pub conflict: ConflictPolicy,
    pub separator: &'a str,
}

fn combine(left: &Record, right: &Record, spec: &MergeSpec<'_>) -> Record {
    let mut out = left.clone();
    for (k, rv) in right {
        if spec.right_on.contains(k) && !spec.left_on.contains(k) {
            continue;
        }
        let Some(lv) = out.get(k) else {
            out.insert(k.clone(), rv.clone());
            continue;
        };
        if spec.left_on.contains(k) || lv == rv {
            continue;
        }
        let merged = match spec.conflict {
            ConflictPolicy::LeftWins => continue,
            ConflictPolicy::RightWins => rv.clone(),
            ConflictPolicy::Concatenate => Value::String(format!(
                "{}{}{}",
                to_display_string(lv),
                spec.separator,
                to_display_string(rv)
            )),
            ConflictPolicy::Array => Value::Array(vec![lv.clone(), rv.clone()]),
        };
        out.insert(k.clone(), merged);
    }
    out
}

/// Right-only rows keep their own key fields under the left key names.
fn right_only(right: &Record, spec: &MergeSpec<'_>) -> Record {
    let mut out = right.clone();
    for (l, r) in spec.left_on.iter().zip(spec.right_on) {
        if l != r {
            if let Some(v) = out.remove(r) {
                out.insert(l.clone(), v);
            }
        }
    }
    out
}

/// Join `left` and `right` on the declared keys. Output order: left rows in
/// order (each followed by its matches), then unmatched right rows for
/// right/full joins.
pub(super) fn merge(left: &[Record], right: &[Record], spec: &MergeSpec<'_>) -> Vec<Record> {
    let mut right_index: HashMap<Vec<String>, Vec<usize>> = HashMap::new();
    for (i, row) in right.iter().enumerate() {
        right_index
            .entry(key_of(row, spec.right_on))
            .or_default()
            .push(i);
    }

    let mut matched_right: HashSet<usize> = HashSet::new();
    let mut out = Vec::new();
    for l in left {
        match right_index.get(&key_of(l, spec.left_on)) {
            Some(hits) => {
                for &i in hits {
                    matched_right.insert(i);
                    out.push(combine(l, &right[i], spec));
                }
            }
            None if matches!(spec.join, JoinType::Left | JoinType::Full) => out.push(l.clone()),
            None => {}
        }
    }

    if matches!(spec.join, JoinType::Right | JoinType::Full) {
        for (i, r) in right.iter().enumerate() {
            if !matched_right.contains(&i) {
                out.push(right_only(r, spec));
            }
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

    fn spec(on_miss: MissPolicy, default_value: Option<&Value>) -> EnrichSpec<'_> {
        EnrichSpec {
            join_key: "dept",
            lookup_key: "code",
            target_field: "dept_name",
            value_field: Some("name"),
            on_miss,
            default_value,
        }
    }

    #[test]
    fn enrich_miss_policies() {
        let table = json!([{ "code": "ops", "name": "Operations" }]);
        let input = rows(json!([{ "dept": "ops" }, { "dept": "hr" }]));

        let filled = enrich(input.clone(), &table, &spec(MissPolicy::NullFill, None)).unwrap();
        assert_eq!(filled[0]["dept_name"], "Operations");
        assert_eq!(filled[1]["dept_name"], Value::Null);

        let skipped = enrich(input.clone(), &table, &spec(MissPolicy::SkipRecord, None)).unwrap();
        assert_eq!(skipped.len(), 1);

        let fallback = json!("n/a");
        let defaulted =
            enrich(input.clone(), &table, &spec(MissPolicy::DefaultValue, Some(&fallback))).unwrap();
        assert_eq!(defaulted[1]["dept_name"], "n/a");

        let err = enrich(input, &table, &spec(MissPolicy::Error, None)).unwrap_err();
        assert!(matches!(err, NodeError::LookupMiss(_)));
    }

    #[test]
    fn enrich_accepts_keyed_object_tables() {
        let table = json!({ "ops": { "name": "Operations" } });
        let out = enrich(rows(json!([{ "dept": "ops" }])), &table, &spec(MissPolicy::Error, None))
            .unwrap();
        assert_eq!(out[0]["dept_name"], "Operations");
    }

    fn merge_spec<'a>(on: &'a [String], join: JoinType, conflict: ConflictPolicy) -> MergeSpec<'a> {
        MergeSpec {
            left_on: on,
            right_on: on,
            join,
            conflict,
            separator: " ",
        }
    }

    #[test]
    fn join_types() {
        let on = vec!["id".to_string()];
        let left = rows(json!([{ "id": 1, "a": "x" }, { "id": 2, "a": "y" }]));
        let right = rows(json!([{ "id": 2, "b": "p" }, { "id": 3, "b": "q" }]));

        let count = |join| merge(&left, &right, &merge_spec(&on, join, ConflictPolicy::LeftWins)).len();
        assert_eq!(count(JoinType::Inner), 1);
        assert_eq!(count(JoinType::Left), 2);
        assert_eq!(count(JoinType::Right), 2);
        assert_eq!(count(JoinType::Full), 3);
    }

    #[test]
    fn conflict_policies() {
        let on = vec!["id".to_string()];
        let left = rows(json!([{ "id": 1, "name": "ana" }]));
        let right = rows(json!([{ "id": 1, "name": "bo" }]));
        let run = |c| merge(&left, &right, &merge_spec(&on, JoinType::Inner, c))[0]["name"].clone();
        assert_eq!(run(ConflictPolicy::LeftWins), "ana");
        assert_eq!(run(ConflictPolicy::RightWins), "bo");
        assert_eq!(run(ConflictPolicy::Concatenate), "ana bo");
        assert_eq!(run(ConflictPolicy::Array), json!(["ana", "bo"]));
    }
}
