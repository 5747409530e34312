//! Condition evaluation shared by filter transforms, conditional nodes,
//! branch guards and output-binding guards.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{ContextSnapshot, ExecutionContext};
use crate::value::{as_bool, as_strict_number, is_empty, lookup_path, to_display_string};
use crate::NodeError;

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Contains,
    NotContains,
    IsEmpty,
    IsNotEmpty,
}

/// Declared coercion applied to both sides before comparing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonType {
    String,
    Number,
    Boolean,
}

/// A single `{field, operator, value}` test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_type: Option<ComparisonType>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// AND/OR over a list of conditions. An empty group is true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConditionGroup {
    #[serde(default)]
    pub operator: LogicalOperator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Anything a condition's `field` can be resolved against.
pub trait FieldSource {
    fn field(&self, path: &str) -> Option<&Value>;
}

impl FieldSource for ExecutionContext {
    fn field(&self, path: &str) -> Option<&Value> {
        self.resolve(path)
    }
}

impl FieldSource for ContextSnapshot {
    fn field(&self, path: &str) -> Option<&Value> {
        self.resolve(path)
    }
}

impl FieldSource for Map<String, Value> {
    fn field(&self, path: &str) -> Option<&Value> {
        if let Some(v) = self.get(path) {
            return Some(v);
        }
        let (root, rest) = path.split_once('.')?;
        lookup_path(self.get(root)?, rest)
    }
}

impl FieldSource for Value {
    fn field(&self, path: &str) -> Option<&Value> {
        lookup_path(self, path)
    }
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            comparison_type: None,
        }
    }

    pub fn typed(mut self, comparison_type: ComparisonType) -> Self {
        self.comparison_type = Some(comparison_type);
        self
    }

    /// Evaluate against a source. A missing field reads as null.
    pub fn evaluate<S: FieldSource + ?Sized>(&self, source: &S) -> Result<bool, NodeError> {
        let null = Value::Null;
        let left = source.field(&self.field).unwrap_or(&null);
        compare_values(left, self.operator, &self.value, self.comparison_type)
            .map_err(|msg| NodeError::TypeMismatch(format!("field '{}': {msg}", self.field)))
    }
}

impl ConditionGroup {
    pub fn all(conditions: Vec<Condition>) -> Self {
        Self {
            operator: LogicalOperator::And,
            conditions,
        }
    }

    pub fn any(conditions: Vec<Condition>) -> Self {
        Self {
            operator: LogicalOperator::Or,
            conditions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn evaluate<S: FieldSource + ?Sized>(&self, source: &S) -> Result<bool, NodeError> {
        if self.conditions.is_empty() {
            return Ok(true);
        }
        match self.operator {
            LogicalOperator::And => {
                for condition in &self.conditions {
                    if !condition.evaluate(source)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            LogicalOperator::Or => {
                for condition in &self.conditions {
                    if condition.evaluate(source)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

/// Compare `left <op> right` under an optional declared type.
///
/// With a declared type both sides are coerced first and a failed coercion
/// is an error, never a silent fallback. Without one, numbers (or numeric
/// strings) on both sides compare numerically and everything else compares
/// as strings.
pub fn compare_values(
    left: &Value,
    op: Operator,
    right: &Value,
    declared: Option<ComparisonType>,
) -> Result<bool, String> {
    use std::cmp::Ordering;

    let holds: fn(Ordering) -> bool = match op {
        Operator::IsEmpty => return Ok(is_empty(left)),
        Operator::IsNotEmpty => return Ok(!is_empty(left)),
        Operator::Contains => return Ok(contains(left, right)),
        Operator::NotContains => return Ok(!contains(left, right)),
        Operator::Equals => Ordering::is_eq,
        Operator::NotEquals => Ordering::is_ne,
        Operator::GreaterThan => Ordering::is_gt,
        Operator::LessThan => Ordering::is_lt,
        Operator::GreaterOrEqual => Ordering::is_ge,
        Operator::LessOrEqual => Ordering::is_le,
    };

    let ordering: Ordering = match declared {
        Some(ComparisonType::Number) => {
            let l = as_strict_number(left)
                .ok_or_else(|| format!("{} is not a number", display(left)))?;
            let r = as_strict_number(right)
                .ok_or_else(|| format!("{} is not a number", display(right)))?;
            l.partial_cmp(&r).ok_or("NaN is not comparable")?
        }
        Some(ComparisonType::Boolean) => {
            let l = as_bool(left).ok_or_else(|| format!("{} is not a boolean", display(left)))?;
            let r = as_bool(right).ok_or_else(|| format!("{} is not a boolean", display(right)))?;
            l.cmp(&r)
        }
        Some(ComparisonType::String) => to_display_string(left).cmp(&to_display_string(right)),
        None => match (left, right) {
            (Value::Bool(l), Value::Bool(r)) => l.cmp(r),
            _ => match (as_strict_number(left), as_strict_number(right)) {
                (Some(l), Some(r)) => l.partial_cmp(&r).unwrap_or(Ordering::Equal),
                _ => {
                    if matches!(op, Operator::Equals | Operator::NotEquals)
                        && (left.is_array() || left.is_object())
                    {
                        let equal = left == right;
                        return Ok(if op == Operator::Equals { equal } else { !equal });
                    }
                    to_display_string(left).cmp(&to_display_string(right))
                }
            },
        },
    };

    Ok(holds(ordering))
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items
            .iter()
            .any(|item| item == needle || to_display_string(item) == to_display_string(needle)),
        Value::Object(map) => map.contains_key(&to_display_string(needle)),
        Value::Null => false,
        other => to_display_string(other).contains(&to_display_string(needle)),
    }
}

fn display(v: &Value) -> String {
    match v {
        Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    }
}
