//! Record transformation sub-engine.
//!
//! Every operation is pure: an array of records in, an array of records and
//! an optional scalar out. Operations that need more than their input
//! (`enrich`'s lookup table, `merge`'s right-hand source) receive it already
//! resolved through [`Inputs`]; the executor does any I/O beforehand.

mod join;
mod records;
mod reshape;
mod script;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::ConditionGroup;
use crate::template;
use crate::NodeError;

pub use join::{LookupSource, MissPolicy};

pub type Record = Map<String, Value>;

/// Result of one operation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformResult {
    pub records: Vec<Record>,
    pub scalar: Option<Value>,
}

impl TransformResult {
    fn records(records: Vec<Record>) -> Self {
        Self {
            records,
            scalar: None,
        }
    }
}

/// Auxiliary inputs resolved by the caller.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    /// Lookup rows for `enrich`.
    pub lookup: Option<Value>,
    /// Right-hand records for `merge`.
    pub right: Option<Vec<Record>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortField {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    CountDistinct,
    #[default]
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::CountDistinct => "count_distinct",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// Not needed for `count`.
    #[serde(default)]
    pub field: Option<String>,
    pub function: AggregateFn,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Aggregation {
    /// Output key: the alias, or `<function>_<field>`.
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.field) {
            (Some(alias), _) => alias.clone(),
            (None, Some(field)) => format!("{}_{field}", self.function.as_str()),
            (None, None) => self.function.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path in the input record.
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    First,
    Last,
    Max,
    Min,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlattenMode {
    /// One record per element of the array field.
    #[default]
    Expand,
    /// Lift the object field's members to the top level.
    Extract,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    /// One record per piece.
    #[default]
    Expand,
    /// Pieces stored as an array field.
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinType {
    #[default]
    Left,
    Inner,
    Right,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    LeftWins,
    RightWins,
    Concatenate,
    #[serde(alias = "produce_array")]
    Array,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    String,
    #[default]
    Number,
    Boolean,
    Object,
    Array,
}

fn default_separator() -> String {
    "_".to_string()
}

fn default_true() -> bool {
    true
}

fn default_items_field() -> String {
    "items".to_string()
}

fn default_name_field() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

fn default_concat_separator() -> String {
    " ".to_string()
}

/// One transform sub-operation, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOperation {
    Filter {
        conditions: ConditionGroup,
    },
    Sort {
        fields: Vec<SortField>,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        aggregations: Vec<Aggregation>,
    },
    Map {
        mappings: Vec<FieldMapping>,
        #[serde(default)]
        keep_unmapped: bool,
    },
    Deduplicate {
        key_fields: Vec<String>,
        #[serde(default)]
        strategy: DedupStrategy,
        #[serde(default)]
        compare_field: Option<String>,
    },
    Enrich {
        join_key: String,
        source: LookupSource,
        target_field: String,
        /// Key field in the lookup rows; defaults to `join_key`.
        #[serde(default)]
        lookup_key: Option<String>,
        /// Field taken from the matched row; the whole row when absent.
        #[serde(default)]
        value_field: Option<String>,
        #[serde(default)]
        on_miss: MissPolicy,
        #[serde(default)]
        default_value: Option<Value>,
    },
    Flatten {
        field: String,
        #[serde(default)]
        mode: FlattenMode,
        #[serde(default = "default_separator")]
        separator: String,
        #[serde(default = "default_true")]
        prefix: bool,
    },
    Group {
        key_fields: Vec<String>,
        #[serde(default = "default_items_field")]
        items_field: String,
    },
    Pivot {
        row_fields: Vec<String>,
        column_field: String,
        value_field: String,
        #[serde(default)]
        function: AggregateFn,
    },
    Unpivot {
        id_fields: Vec<String>,
        /// Columns to melt; every non-id field when empty.
        #[serde(default)]
        value_fields: Vec<String>,
        #[serde(default = "default_name_field")]
        name_field: String,
        #[serde(default = "default_value_name")]
        value_name: String,
    },
    Split {
        field: String,
        delimiter: String,
        #[serde(default)]
        mode: SplitMode,
        #[serde(default)]
        target_field: Option<String>,
    },
    Merge {
        /// Context key of the right-hand source.
        right: String,
        left_on: Vec<String>,
        #[serde(default)]
        right_on: Vec<String>,
        #[serde(default)]
        join: JoinType,
        #[serde(default)]
        conflict: ConflictPolicy,
        #[serde(default = "default_concat_separator")]
        separator: String,
    },
    Expression {
        expression: String,
        target_field: String,
        #[serde(default)]
        output_type: OutputType,
    },
}

fn invalid(op: &str, msg: impl std::fmt::Display) -> NodeError {
    NodeError::config(format!("{op}: {msg}"))
}

impl TransformOperation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "filter",
            Self::Sort { .. } => "sort",
            Self::Aggregate { .. } => "aggregate",
            Self::Map { .. } => "map",
            Self::Deduplicate { .. } => "deduplicate",
            Self::Enrich { .. } => "enrich",
            Self::Flatten { .. } => "flatten",
            Self::Group { .. } => "group",
            Self::Pivot { .. } => "pivot",
            Self::Unpivot { .. } => "unpivot",
            Self::Split { .. } => "split",
            Self::Merge { .. } => "merge",
            Self::Expression { .. } => "expression",
        }
    }

    /// Check required sub-fields. Runs before any data is touched.
    pub fn validate(&self) -> Result<(), NodeError> {
        let op = self.name();
        match self {
            Self::Filter { .. } => {}
            Self::Sort { fields } => {
                if fields.is_empty() || fields.iter().any(|f| f.field.is_empty()) {
                    return Err(invalid(op, "at least one non-empty sort field is required"));
                }
            }
            Self::Aggregate { aggregations, .. } => {
                if aggregations.is_empty() {
                    return Err(invalid(op, "at least one aggregation is required"));
                }
                for agg in aggregations {
                    if agg.function != AggregateFn::Count
                        && agg.field.as_deref().map_or(true, str::is_empty)
                    {
                        return Err(invalid(
                            op,
                            format!("'{}' needs a field", agg.function.as_str()),
                        ));
                    }
                }
            }
            Self::Map { mappings, .. } => {
                if mappings.is_empty() {
                    return Err(invalid(op, "at least one mapping is required"));
                }
                if mappings
                    .iter()
                    .any(|m| m.source.is_empty() || m.target.is_empty())
                {
                    return Err(invalid(op, "mappings need both source and target"));
                }
            }
            Self::Deduplicate {
                key_fields,
                strategy,
                compare_field,
            } => {
                if key_fields.is_empty() {
                    return Err(invalid(op, "key_fields is required"));
                }
                if matches!(strategy, DedupStrategy::Max | DedupStrategy::Min)
                    && compare_field.is_none()
                {
                    return Err(invalid(op, "max/min strategies need compare_field"));
                }
            }
            Self::Enrich {
                join_key,
                target_field,
                on_miss,
                default_value,
                ..
            } => {
                if join_key.is_empty() || target_field.is_empty() {
                    return Err(invalid(op, "join_key and target_field are required"));
                }
                if *on_miss == MissPolicy::DefaultValue && default_value.is_none() {
                    return Err(invalid(op, "default_value policy needs default_value"));
                }
            }
            Self::Flatten { field, .. } => {
                if field.is_empty() {
                    return Err(invalid(op, "field is required"));
                }
            }
            Self::Group { key_fields, .. } => {
                if key_fields.is_empty() {
                    return Err(invalid(op, "key_fields is required"));
                }
            }
            Self::Pivot {
                row_fields,
                column_field,
                value_field,
                ..
            } => {
                if row_fields.is_empty() || column_field.is_empty() || value_field.is_empty() {
                    return Err(invalid(
                        op,
                        "row_fields, column_field and value_field are required",
                    ));
                }
            }
            Self::Unpivot { id_fields, .. } => {
                if id_fields.is_empty() {
                    return Err(invalid(op, "id_fields is required"));
                }
            }
            Self::Split {
                field, delimiter, ..
            } => {
                if field.is_empty() || delimiter.is_empty() {
                    return Err(invalid(op, "field and a non-empty delimiter are required"));
                }
            }
            Self::Merge {
                right,
                left_on,
                right_on,
                ..
            } => {
                if right.is_empty() || left_on.is_empty() {
                    return Err(invalid(op, "right and left_on are required"));
                }
                if !right_on.is_empty() && right_on.len() != left_on.len() {
                    return Err(invalid(op, "left_on and right_on differ in length"));
                }
            }
            Self::Expression {
                expression,
                target_field,
                ..
            } => {
                if target_field.is_empty() {
                    return Err(invalid(op, "target_field is required"));
                }
                if !template::is_template(expression) {
                    script::Script::compile(expression)?;
                }
            }
        }
        Ok(())
    }

    /// Validate, then apply to `records`.
    pub fn apply(&self, records: Vec<Record>, inputs: &Inputs) -> Result<TransformResult, NodeError> {
        self.validate()?;
        match self {
            Self::Filter { conditions } => {
                records::filter(records, conditions).map(TransformResult::records)
            }
            Self::Sort { fields } => Ok(TransformResult::records(records::sort(records, fields))),
            Self::Aggregate {
                group_by,
                aggregations,
            } => Ok(reshape::aggregate(&records, group_by, aggregations)),
            Self::Map {
                mappings,
                keep_unmapped,
            } => Ok(TransformResult::records(records::map(
                records,
                mappings,
                *keep_unmapped,
            ))),
            Self::Deduplicate {
                key_fields,
                strategy,
                compare_field,
            } => Ok(TransformResult::records(records::deduplicate(
                records,
                key_fields,
                *strategy,
                compare_field.as_deref(),
            ))),
            Self::Enrich {
                join_key,
                target_field,
                lookup_key,
                value_field,
                on_miss,
                default_value,
                ..
            } => {
                let table = inputs
                    .lookup
                    .as_ref()
                    .ok_or_else(|| invalid("enrich", "lookup source was not resolved"))?;
                join::enrich(
                    records,
                    table,
                    &join::EnrichSpec {
                        join_key,
                        lookup_key: lookup_key.as_deref().unwrap_or(join_key),
                        target_field,
                        value_field: value_field.as_deref(),
                        on_miss: *on_miss,
                        default_value: default_value.as_ref(),
                    },
                )
                .map(TransformResult::records)
            }
            Self::Flatten {
                field,
                mode,
                separator,
                prefix,
            } => Ok(TransformResult::records(records::flatten(
                records, field, *mode, separator, *prefix,
            ))),
            Self::Group {
                key_fields,
                items_field,
            } => Ok(TransformResult::records(reshape::group(
                records,
                key_fields,
                items_field,
            ))),
            Self::Pivot {
                row_fields,
                column_field,
                value_field,
                function,
            } => Ok(TransformResult::records(reshape::pivot(
                &records,
                row_fields,
                column_field,
                value_field,
                *function,
            ))),
            Self::Unpivot {
                id_fields,
                value_fields,
                name_field,
                value_name,
            } => Ok(TransformResult::records(reshape::unpivot(
                &records,
                id_fields,
                value_fields,
                name_field,
                value_name,
            ))),
            Self::Split {
                field,
                delimiter,
                mode,
                target_field,
            } => Ok(TransformResult::records(records::split(
                records,
                field,
                delimiter,
                *mode,
                target_field.as_deref().unwrap_or(field),
            ))),
            Self::Merge {
                left_on,
                right_on,
                join,
                conflict,
                separator,
                ..
            } => {
                let right = inputs
                    .right
                    .as_ref()
                    .ok_or_else(|| invalid("merge", "right-hand source was not resolved"))?;
                let right_on = if right_on.is_empty() { left_on } else { right_on };
                Ok(TransformResult::records(join::merge(
                    &records,
                    right,
                    &join::MergeSpec {
                        left_on,
                        right_on,
                        join: *join,
                        conflict: *conflict,
                        separator,
                    },
                )))
            }
            Self::Expression {
                expression,
                target_field,
                output_type,
            } => records::expression(records, expression, target_field, *output_type)
                .map(TransformResult::records),
        }
    }
}

/// Grouping key of a record over `fields`, as display strings.
pub(crate) fn key_of(record: &Record, fields: &[String]) -> Vec<String> {
    use crate::condition::FieldSource;
    fields
        .iter()
        .map(|f| {
            record
                .field(f)
                .map(crate::value::to_display_string)
                .unwrap_or_default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(v: Value) -> Vec<Record> {
        crate::value::as_records(&v).unwrap()
    }

    #[test]
    fn malformed_config_fails_before_data_is_touched() {
        let op: TransformOperation = serde_json::from_value(json!({
            "op": "deduplicate", "key_fields": ["id"], "strategy": "max"
        }))
        .unwrap();
        let err = op.apply(rows(json!([{ "id": 1 }])), &Inputs::default()).unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }

    #[test]
    fn expression_formula_is_syntax_checked() {
        let op = TransformOperation::Expression {
            expression: "price +* qty".into(),
            target_field: "total".into(),
            output_type: OutputType::Number,
        };
        assert!(matches!(op.validate(), Err(NodeError::FormulaSyntax(_))));
    }

    #[test]
    fn operations_deserialize_from_tagged_json() {
        let op: TransformOperation = serde_json::from_value(json!({
            "op": "merge", "right": "owners", "left_on": ["owner_id"], "right_on": ["id"],
            "join": "inner", "conflict": "produce_array"
        }))
        .unwrap();
        assert_eq!(op.name(), "merge");
        assert!(op.validate().is_ok());
    }
}
