//! `{{variableKey}}` substitution for prompts, titles, descriptions and
//! request bodies.
//!
//! Unresolved keys render as an empty string everywhere.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::condition::FieldSource;
use crate::value::to_display_string;

/// `None` only if the pattern fails to compile; text then passes through.
fn placeholder() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-:]+)\s*\}\}").ok())
        .as_ref()
}

/// Whether a string contains at least one placeholder.
pub fn is_template(s: &str) -> bool {
    placeholder().is_some_and(|re| re.is_match(s))
}

/// Substitute every placeholder with the resolved value's display string.
pub fn render<S: FieldSource + ?Sized>(template: &str, source: &S) -> String {
    let Some(re) = placeholder() else {
        return template.to_string();
    };
    re.replace_all(template, |caps: &regex::Captures<'_>| {
        source
            .field(&caps[1])
            .map(to_display_string)
            .unwrap_or_default()
    })
    .into_owned()
}

/// Keys referenced by a template, in order of appearance.
pub fn referenced_keys(template: &str) -> Vec<String> {
    placeholder()
        .map(|re| {
            re.captures_iter(template)
                .map(|caps| caps[1].to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Render every string inside a JSON value.
///
/// A string that is exactly one placeholder is replaced by the resolved
/// value itself so that numbers and objects keep their type.
pub fn render_value<S: FieldSource + ?Sized>(value: &Value, source: &S) -> Value {
    match value {
        Value::String(s) => {
            if let Some(caps) = placeholder().and_then(|re| re.captures(s)) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(s.trim().len()) {
                    return source.field(&caps[1]).cloned().unwrap_or(Value::Null);
                }
                return Value::String(render(s, source));
            }
            value.clone()
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, source)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, source)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use serde_json::json;

    fn ctx() -> ExecutionContext {
        ExecutionContext::with_inputs([
            ("name".to_string(), json!("Pump 7")),
            ("score".to_string(), json!(82)),
            ("asset".to_string(), json!({ "owner": "ops" })),
        ])
    }

    #[test]
    fn renders_known_and_blanks_unknown_keys() {
        let out = render("Risk on {{name}} ({{ score }}) by {{asset.owner}}{{missing}}", &ctx());
        assert_eq!(out, "Risk on Pump 7 (82) by ops");
    }

    #[test]
    fn whole_placeholder_keeps_value_type() {
        let v = render_value(&json!({ "s": "{{score}}", "t": "n={{score}}" }), &ctx());
        assert_eq!(v, json!({ "s": 82, "t": "n=82" }));
    }

    #[test]
    fn lists_referenced_keys() {
        assert_eq!(referenced_keys("{{a}} and {{ b.c }}"), vec!["a", "b.c"]);
        assert!(!is_template("plain"));
    }

    #[test]
    fn placeholder_pattern_is_available() {
        assert!(placeholder().is_some());
        assert!(is_template("{{ a }}"));
        assert_eq!(render("no placeholders", &ctx()), "no placeholders");
    }
}
