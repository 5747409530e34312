//! Source node: load tabular or domain-record data into the context.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::{NodeConfig, NodeKind};
use crate::context::{ContextWrite, WriteMode};
use crate::domain::{DomainRegistry, RecordCollection};
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::NodeError;

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Json,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Inline {
        data: Value,
    },
    Json {
        content: String,
    },
    Csv {
        content: String,
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    File {
        path: String,
        /// Inferred from the extension when absent.
        #[serde(default)]
        format: Option<FileFormat>,
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    Records {
        collection: RecordCollection,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub output_key: String,
    pub source: SourceSpec,
    #[serde(default)]
    pub mode: WriteMode,
}

pub struct SourceNode {
    domain: Arc<dyn DomainRegistry>,
}

impl SourceNode {
    pub fn new(domain: Arc<dyn DomainRegistry>) -> Self {
        Self { domain }
    }

    async fn load(&self, spec: &SourceSpec) -> Result<Value, NodeError> {
        match spec {
            SourceSpec::Inline { data } => Ok(data.clone()),
            SourceSpec::Json { content } => parse_json(content),
            SourceSpec::Csv { content, delimiter } => parse_csv(content, *delimiter),
            SourceSpec::File {
                path,
                format,
                delimiter,
            } => {
                let format = match format {
                    Some(f) => *f,
                    None => infer_format(path)?,
                };
                let text = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| NodeError::Parse(format!("reading {path}: {e}")))?;
                match format {
                    FileFormat::Json => parse_json(&text),
                    FileFormat::Csv => parse_csv(&text, *delimiter),
                }
            }
            SourceSpec::Records { collection } => self
                .domain
                .records(*collection)
                .await
                .map(Value::Array)
                .map_err(|e| NodeError::Domain(e.to_string())),
        }
    }
}

fn infer_format(path: &str) -> Result<FileFormat, NodeError> {
    match Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => Ok(FileFormat::Json),
        Some("csv") => Ok(FileFormat::Csv),
        _ => Err(NodeError::config(format!(
            "cannot infer format of '{path}'; set `format` to json or csv"
        ))),
    }
}

fn parse_json(text: &str) -> Result<Value, NodeError> {
    serde_json::from_str(text).map_err(|e| NodeError::Parse(format!("invalid JSON: {e}")))
}

/// Split CSV text into rows of fields. Handles quoted fields, doubled quotes
/// and line breaks inside quotes.
fn csv_rows(text: &str, delimiter: char) -> Result<Vec<Vec<String>>, NodeError> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            c if c == delimiter => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            other => field.push(other),
        }
    }
    if in_quotes {
        return Err(NodeError::Parse("unterminated quoted CSV field".into()));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].trim().is_empty()));
    Ok(rows)
}

fn infer_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match trimmed {
        "true" | "TRUE" | "True" => return Value::Bool(true),
        "false" | "FALSE" | "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return crate::value::number(f);
        }
    }
    Value::String(raw.to_string())
}

/// Parse CSV with a header row into an array of records.
pub fn parse_csv(text: &str, delimiter: char) -> Result<Value, NodeError> {
    let mut rows = csv_rows(text, delimiter)?.into_iter();
    let Some(header) = rows.next() else {
        return Ok(Value::Array(Vec::new()));
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    let mut records = Vec::new();
    for (line, cells) in rows.enumerate() {
        if cells.len() > header.len() {
            return Err(NodeError::Parse(format!(
                "CSV row {} has {} fields, header has {}",
                line + 2,
                cells.len(),
                header.len()
            )));
        }
        let mut record = Map::new();
        for (i, name) in header.iter().enumerate() {
            let value = cells.get(i).map(|c| infer_cell(c)).unwrap_or(Value::Null);
            record.insert(name.clone(), value);
        }
        records.push(Value::Object(record));
    }
    Ok(Value::Array(records))
}

#[async_trait]
impl ExecutableNode for SourceNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Source
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Source(cfg) = config else {
            return Err(unexpected_config(NodeKind::Source, config));
        };
        let data = self.load(&cfg.source).await?;
        debug!(
            node_id = ctx.node_id,
            rows = data.as_array().map(Vec::len).unwrap_or(1),
            "source loaded"
        );
        Ok(NodeOutput::new(data.clone()).with_write(ContextWrite {
            key: cfg.output_key.clone(),
            value: data,
            mode: cfg.mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::context::ExecutionContext;
    use crate::domain::InMemoryDomain;
    use serde_json::json;

    fn node() -> SourceNode {
        SourceNode::new(Arc::new(InMemoryDomain::new()))
    }

    #[test]
    fn csv_quotes_and_inference() {
        let text = "id,name,score,active\n1,\"Smith, J\",4.5,true\n2,\"say \"\"hi\"\"\",,false\n";
        let rows = parse_csv(text, ',').unwrap();
        assert_eq!(rows[0]["name"], "Smith, J");
        assert_eq!(rows[0]["score"], 4.5);
        assert_eq!(rows[0]["active"], true);
        assert_eq!(rows[1]["name"], "say \"hi\"");
        assert_eq!(rows[1]["score"], Value::Null);
    }

    #[test]
    fn csv_with_too_many_fields_is_a_parse_error() {
        assert!(matches!(parse_csv("a,b\n1,2,3\n", ','), Err(NodeError::Parse(_))));
    }

    #[tokio::test]
    async fn json_parse_errors_fail_the_node() {
        let err = run(
            &node(),
            json!({ "output_key": "rows", "source": { "kind": "json", "content": "{oops" } }),
            &ExecutionContext::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Parse(_)));
    }

    #[tokio::test]
    async fn inline_data_is_written_under_output_key() {
        let out = run(
            &node(),
            json!({ "output_key": "rows", "source": { "kind": "inline", "data": [{ "a": 1 }] } }),
            &ExecutionContext::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.writes[0].key, "rows");
        assert_eq!(out.writes[0].value, json!([{ "a": 1 }]));
    }

    #[tokio::test]
    async fn file_source_reads_csv_by_extension() {
        let path = std::env::temp_dir().join(format!("procflow-src-{}.csv", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, "k;v\na;1\n").await.unwrap();
        let out = run(
            &node(),
            json!({ "output_key": "rows", "source": {
                "kind": "file", "path": path.to_string_lossy(), "delimiter": ";"
            } }),
            &ExecutionContext::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.value, json!([{ "k": "a", "v": 1 }]));
        let _ = tokio::fs::remove_file(path).await;
    }
}
