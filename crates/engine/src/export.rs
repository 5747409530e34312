//! Run export and import.
//!
//! The export document maps every context key to its final value. Importing
//! it seeds a new run's context, with every key owned by the input producer.

use serde_json::Value;

use nodes::{ContextSnapshot, ExecutionContext};

use crate::models::ExecutionRun;
use crate::EngineError;

pub fn export_json(snapshot: &ContextSnapshot) -> Value {
    snapshot.to_json()
}

/// Pretty-printed export of a run's final context.
pub fn export_run(run: &ExecutionRun) -> Result<String, EngineError> {
    Ok(serde_json::to_string_pretty(&export_json(&run.context))?)
}

pub fn import_context(document: &Value) -> Result<ExecutionContext, EngineError> {
    let Value::Object(entries) = document else {
        return Err(EngineError::Export(
            "export document must be a JSON object".into(),
        ));
    };
    Ok(ExecutionContext::with_inputs(
        entries.iter().map(|(k, v)| (k.clone(), v.clone())),
    ))
}

/// Parse `key=value` pairs; values are read as JSON when they parse,
/// otherwise as plain strings.
pub fn parse_input_pairs<'a>(
    pairs: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<(String, Value)>, EngineError> {
    pairs
        .into_iter()
        .map(|pair| {
            let (key, raw) = pair
                .split_once('=')
                .ok_or_else(|| EngineError::Export(format!("input '{pair}' is not key=value")))?;
            let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            Ok((key.trim().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn export_then_import_seeds_the_same_values() {
        let ctx = ExecutionContext::with_inputs([
            ("a".to_string(), json!(1)),
            ("rows".to_string(), json!([{ "x": true }])),
        ]);
        let document = export_json(&ctx.snapshot());
        assert_eq!(document, json!({ "a": 1, "rows": [{ "x": true }] }));

        let seeded = import_context(&document).unwrap();
        assert_eq!(seeded.snapshot(), ctx.snapshot());
        assert_eq!(seeded.producer_of("a"), Some(nodes::context::INPUT_PRODUCER));
    }

    #[test]
    fn import_rejects_non_objects() {
        assert!(matches!(import_context(&json!([1, 2])), Err(EngineError::Export(_))));
    }

    #[test]
    fn input_pairs_parse_json_or_fall_back_to_strings() {
        let parsed = parse_input_pairs(["n=42", "name=Pump 7", "flags=[1,2]"]).unwrap();
        assert_eq!(
            parsed,
            vec![
                ("n".to_string(), json!(42)),
                ("name".to_string(), json!("Pump 7")),
                ("flags".to_string(), json!([1, 2])),
            ]
        );
        assert!(parse_input_pairs(["oops"]).is_err());
    }
}
