//! Transform node: resolve inputs from the context and run one sub-operation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::retry::{with_retry, RetryPolicy};
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::transform::{Inputs, LookupSource, TransformOperation};
use crate::transport::{is_retryable_status, HttpRequest, HttpTransport};
use crate::value::{as_records, lookup_path};
use crate::NodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Context key holding the input records.
    pub input_key: String,
    pub output_key: String,
    pub operation: TransformOperation,
    /// Where to store the operation's scalar result, if it has one.
    #[serde(default)]
    pub scalar_key: Option<String>,
    /// Retry policy for an external enrichment lookup; the default when unset.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

pub struct TransformNode {
    transport: Arc<dyn HttpTransport>,
}

impl TransformNode {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    async fn fetch_lookup(
        &self,
        url: &str,
        method: crate::transport::HttpMethod,
        rows_path: Option<&str>,
        retry: &RetryPolicy,
        ctx: &NodeContext<'_>,
    ) -> Result<Value, NodeError> {
        let url = crate::template::render(url, ctx.variables);
        let transport = self.transport.as_ref();
        let (response, _) = with_retry(retry, ctx.cancel, ctx.node_id, |_| {
            let request = HttpRequest::new(method, url.clone());
            async move {
                let response = transport.send(request).await?;
                if !response.is_success() {
                    return Err(NodeError::network(
                        format!("lookup endpoint returned HTTP {}", response.status),
                        is_retryable_status(response.status),
                    ));
                }
                Ok(response)
            }
        })
        .await;
        let body = response?.body_value();
        match rows_path {
            Some(path) => lookup_path(&body, path)
                .cloned()
                .ok_or_else(|| NodeError::Parse(format!("lookup response has no '{path}'"))),
            None => Ok(body),
        }
    }

    async fn resolve_inputs(
        &self,
        cfg: &TransformConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<Inputs, NodeError> {
        let mut inputs = Inputs::default();
        match &cfg.operation {
            TransformOperation::Enrich { source, .. } => {
                inputs.lookup = Some(match source {
                    LookupSource::Context { key } => ctx.variables.resolve(key).cloned().ok_or_else(
                        || NodeError::TypeMismatch(format!("lookup key '{key}' is not set")),
                    )?,
                    LookupSource::Table { rows } => rows.clone(),
                    LookupSource::External {
                        url,
                        method,
                        rows_path,
                    } => {
                        let retry = cfg.retry.clone().unwrap_or_default();
                        self.fetch_lookup(url, *method, rows_path.as_deref(), &retry, ctx)
                            .await?
                    }
                });
            }
            TransformOperation::Merge { right, .. } => {
                let value = ctx.variables.resolve(right).ok_or_else(|| {
                    NodeError::TypeMismatch(format!("merge source '{right}' is not set"))
                })?;
                inputs.right = Some(as_records(value).ok_or_else(|| {
                    NodeError::TypeMismatch(format!("merge source '{right}' is not a record list"))
                })?);
            }
            _ => {}
        }
        Ok(inputs)
    }
}

#[async_trait]
impl ExecutableNode for TransformNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Transform
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Transform(cfg) = config else {
            return Err(unexpected_config(NodeKind::Transform, config));
        };
        cfg.operation.validate()?;

        let input = ctx.variables.resolve(&cfg.input_key).ok_or_else(|| {
            NodeError::TypeMismatch(format!("input '{}' is not set", cfg.input_key))
        })?;
        let records = as_records(input).ok_or_else(|| {
            NodeError::TypeMismatch(format!("input '{}' is not a record list", cfg.input_key))
        })?;
        let inputs = self.resolve_inputs(cfg, ctx).await?;

        let before = records.len();
        let result = cfg.operation.apply(records, &inputs)?;
        debug!(
            node_id = ctx.node_id,
            op = cfg.operation.name(),
            rows_in = before,
            rows_out = result.records.len(),
            "transform applied"
        );

        let rows = Value::Array(result.records.into_iter().map(Value::Object).collect());
        let mut out = NodeOutput::stored(cfg.output_key.clone(), rows);
        if let (Some(key), Some(scalar)) = (&cfg.scalar_key, result.scalar) {
            out = out.with_write(ContextWrite::replace(key.clone(), scalar));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::context::ExecutionContext;
    use crate::mock::MockTransport;
    use serde_json::json;

    fn vars() -> ExecutionContext {
        ExecutionContext::with_inputs([
            (
                "risks".to_string(),
                json!([
                    { "id": "r1", "owner": "u1", "score": 9 },
                    { "id": "r2", "owner": "u2", "score": 3 }
                ]),
            ),
            (
                "owners".to_string(),
                json!([{ "id": "u1", "name": "Ana" }]),
            ),
        ])
    }

    fn node() -> TransformNode {
        TransformNode::new(Arc::new(MockTransport::new()))
    }

    #[tokio::test]
    async fn aggregate_writes_rows_and_scalar() {
        let out = run(
            &node(),
            json!({
                "input_key": "risks", "output_key": "summary", "scalar_key": "total",
                "operation": { "op": "aggregate", "aggregations": [ { "field": "score", "function": "sum" } ] }
            }),
            &vars(),
        )
        .await
        .unwrap();
        assert_eq!(out.writes[1], ContextWrite::replace("total", json!(12)));
    }

    #[tokio::test]
    async fn merge_reads_right_source_from_context() {
        let out = run(
            &node(),
            json!({
                "input_key": "risks", "output_key": "joined",
                "operation": { "op": "merge", "right": "owners", "left_on": ["owner"], "right_on": ["id"], "join": "inner" }
            }),
            &vars(),
        )
        .await
        .unwrap();
        assert_eq!(out.value, json!([{ "id": "r1", "owner": "u1", "score": 9, "name": "Ana" }]));
    }

    #[tokio::test]
    async fn enrich_from_external_lookup() {
        let transport = Arc::new(
            MockTransport::new().respond_json(200, json!({ "data": [{ "id": "u2", "name": "Bo" }] })),
        );
        let node = TransformNode::new(transport.clone());
        let out = run(
            &node,
            json!({
                "input_key": "risks", "output_key": "enriched",
                "operation": {
                    "op": "enrich", "join_key": "owner", "lookup_key": "id",
                    "value_field": "name", "target_field": "owner_name",
                    "source": { "from": "external", "url": "http://dir/users", "rows_path": "data" }
                }
            }),
            &vars(),
        )
        .await
        .unwrap();
        assert_eq!(out.value[1]["owner_name"], "Bo");
        assert_eq!(out.value[0]["owner_name"], Value::Null);
        assert_eq!(transport.requests().len(), 1);
    }

    fn external_enrich(retry: Option<Value>) -> Value {
        let mut cfg = json!({
            "input_key": "risks", "output_key": "enriched",
            "operation": {
                "op": "enrich", "join_key": "owner", "lookup_key": "id",
                "value_field": "name", "target_field": "owner_name",
                "source": { "from": "external", "url": "http://dir/users" }
            }
        });
        if let Some(retry) = retry {
            cfg["retry"] = retry;
        }
        cfg
    }

    #[tokio::test(start_paused = true)]
    async fn external_lookup_honours_the_node_retry_policy() {
        let transport = Arc::new(MockTransport::new().respond_status(503));
        let node = TransformNode::new(transport.clone());
        let retry = json!({ "max_attempts": 2, "delay": "fixed", "initial_delay_ms": 10 });
        let err = run(&node, external_enrich(Some(retry)), &vars()).await.unwrap_err();
        assert!(matches!(err, NodeError::Network { .. }));
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn external_lookup_without_retry_uses_the_default_policy() {
        let transport = Arc::new(MockTransport::new().respond_status(503));
        let node = TransformNode::new(transport.clone());
        let err = run(&node, external_enrich(None), &vars()).await.unwrap_err();
        assert!(matches!(err, NodeError::Network { .. }));
        assert_eq!(
            transport.requests().len() as u32,
            RetryPolicy::default().max_attempts
        );
    }

    #[tokio::test]
    async fn non_record_input_is_a_type_mismatch() {
        let vars = ExecutionContext::with_inputs([("n".to_string(), json!(5))]);
        let err = run(
            &node(),
            json!({
                "input_key": "n", "output_key": "o",
                "operation": { "op": "sort", "fields": [ { "field": "x" } ] }
            }),
            &vars,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn malformed_operation_fails_before_reading_input() {
        let err = run(
            &node(),
            json!({
                "input_key": "absent", "output_key": "o",
                "operation": { "op": "sort", "fields": [] }
            }),
            &ExecutionContext::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::Configuration(_)));
    }
}
