//! Per-record scripted expressions, evaluated with Rhai.
//!
//! Every field of the record is visible as a variable of the same name.

use rhai::{Dynamic, Engine, Scope, AST};
use serde_json::{Map, Number, Value};

use crate::NodeError;

const MAX_OPERATIONS: u64 = 100_000;

/// A compiled expression, reusable across records.
pub(super) struct Script {
    engine: Engine,
    ast: AST,
}

impl Script {
    pub(super) fn compile(expression: &str) -> Result<Self, NodeError> {
        let mut engine = Engine::new();
        engine.set_max_operations(MAX_OPERATIONS);
        engine.on_print(|msg| tracing::debug!(target: "rhai", "{msg}"));
        let ast = engine
            .compile_expression(expression)
            .map_err(|e| NodeError::FormulaSyntax(format!("'{expression}': {e}")))?;
        Ok(Self { engine, ast })
    }

    pub(super) fn eval(&self, record: &Map<String, Value>) -> Result<Value, NodeError> {
        let mut scope = Scope::new();
        for (name, value) in record {
            scope.push_dynamic(name.as_str(), to_dynamic(value));
        }
        self.engine
            .eval_ast_with_scope::<Dynamic>(&mut scope, &self.ast)
            .map(|result| from_dynamic(&result))
            .map_err(|e| NodeError::FormulaEval(e.to_string()))
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => n.as_f64().map(Dynamic::from).unwrap_or(Dynamic::UNIT),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(map) => Dynamic::from_map(
            map.iter()
                .map(|(k, v)| (k.as_str().into(), to_dynamic(v)))
                .collect(),
        ),
    }
}

fn from_dynamic(value: &Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
    }
    if let Ok(c) = value.as_char() {
        return Value::String(c.to_string());
    }
    if let Some(items) = value.clone().try_cast::<rhai::Array>() {
        return Value::Array(items.iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.clone().try_cast::<rhai::Map>() {
        return Value::Object(
            map.iter()
                .map(|(k, v)| (k.to_string(), from_dynamic(v)))
                .collect(),
        );
    }
    match value.clone().into_string() {
        Ok(s) => Value::String(s),
        Err(_) => Value::String(value.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn fields_are_variables() {
        let script = Script::compile("price * qty + 1").unwrap();
        let out = script.eval(&record(json!({ "price": 3, "qty": 4 }))).unwrap();
        assert_eq!(out, json!(13));
    }

    #[test]
    fn booleans_and_comparisons() {
        let script = Script::compile(r#"qty > 3 && status == "open""#).unwrap();
        assert_eq!(
            script.eval(&record(json!({ "qty": 4, "status": "open" }))).unwrap(),
            json!(true)
        );
        assert_eq!(
            script.eval(&record(json!({ "qty": 2, "status": "open" }))).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn strings_and_nested_values() {
        let script = Script::compile(r#"asset.name + "/" + tags[1]"#).unwrap();
        let out = script
            .eval(&record(json!({ "asset": { "name": "pump" }, "tags": ["a", "b"] })))
            .unwrap();
        assert_eq!(out, json!("pump/b"));

        let script = Script::compile(r#"#{ id: id, flags: [id > 1] }"#).unwrap();
        let out = script.eval(&record(json!({ "id": 2 }))).unwrap();
        assert_eq!(out, json!({ "id": 2, "flags": [true] }));
    }

    #[test]
    fn syntax_and_evaluation_errors_are_distinct() {
        assert!(matches!(
            Script::compile("price +* qty"),
            Err(NodeError::FormulaSyntax(_))
        ));
        let script = Script::compile("missing * 2").unwrap();
        assert!(matches!(
            script.eval(&record(json!({}))),
            Err(NodeError::FormulaEval(_))
        ));
    }
}
