//! Helpers over `serde_json::Value`, the engine's dynamic value type.

use serde_json::{Map, Number, Value};

/// Resolve a dotted path (`a.b.0.c`) inside a value.
///
/// Numeric segments index into arrays. Returns `None` when any segment is
/// missing.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Numeric view of a value: numbers, numeric strings and booleans (1/0).
pub fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

/// Strict numeric view: numbers and numeric strings only.
pub fn as_strict_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Boolean view used by declared boolean comparisons.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" | "" => Some(false),
            _ => None,
        },
        Value::Null => Some(false),
        _ => None,
    }
}

/// Render a value the way templates and string comparisons see it:
/// strings raw, null empty, everything else as compact JSON.
pub fn to_display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Number(n) => format_number(n),
        other => other.to_string(),
    }
}

fn format_number(n: &Number) -> String {
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

/// Empty means null, empty string (after trim), empty array or empty object.
pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Build a JSON number, falling back to null for NaN / infinity.
pub fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        return Value::from(f as i64);
    }
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Interpret a value as an array of records.
///
/// A single object is treated as a one-element array; null as empty.
pub fn as_records(value: &Value) -> Option<Vec<Map<String, Value>>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => Some(map.clone()),
                _ => None,
            })
            .collect(),
        Value::Object(map) => Some(vec![map.clone()]),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

/// Total ordering used by sort and min/max selection.
///
/// Nulls sort last; numbers compare numerically; everything else by display
/// string.
pub fn compare(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => match (as_strict_number(a), as_strict_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => to_display_string(a).cmp(&to_display_string(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let v = json!({ "a": { "b": [ { "c": 7 } ] } });
        assert_eq!(lookup_path(&v, "a.b.0.c"), Some(&json!(7)));
        assert_eq!(lookup_path(&v, "a.x"), None);
    }

    #[test]
    fn numbers_render_without_trailing_zero() {
        assert_eq!(to_display_string(&json!(3.0)), "3");
        assert_eq!(to_display_string(&json!(2.5)), "2.5");
        assert_eq!(number(14.0), json!(14));
    }

    #[test]
    fn compare_puts_nulls_last() {
        use std::cmp::Ordering;
        assert_eq!(compare(&Value::Null, &json!(1)), Ordering::Greater);
        assert_eq!(compare(&json!("10"), &json!(9)), Ordering::Greater);
    }
}
