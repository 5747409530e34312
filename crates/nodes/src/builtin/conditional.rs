//! Conditional node: one typed comparison, routed to the `true` or `false`
//! port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::condition::{ComparisonType, Condition, Operator};
use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::NodeError;

pub const TRUE_PORT: &str = "true";
pub const FALSE_PORT: &str = "false";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalConfig {
    /// Context key or dotted path.
    pub field: String,
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    /// Coercion applied to both sides before comparing.
    #[serde(default)]
    pub comparison_type: Option<ComparisonType>,
    #[serde(default)]
    pub output_key: Option<String>,
}

impl ConditionalConfig {
    pub fn condition(&self) -> Condition {
        Condition {
            field: self.field.clone(),
            operator: self.operator,
            value: self.value.clone(),
            comparison_type: self.comparison_type,
        }
    }
}

pub struct ConditionalNode;

#[async_trait]
impl ExecutableNode for ConditionalNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Conditional
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Conditional(cfg) = config else {
            return Err(unexpected_config(NodeKind::Conditional, config));
        };
        let outcome = cfg.condition().evaluate(ctx.variables)?;
        debug!(node_id = ctx.node_id, field = %cfg.field, outcome, "condition evaluated");

        let mut out = NodeOutput::new(Value::Bool(outcome))
            .via_port(if outcome { TRUE_PORT } else { FALSE_PORT });
        if let Some(key) = &cfg.output_key {
            out = out.with_write(ContextWrite::replace(key.clone(), Value::Bool(outcome)));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::context::ExecutionContext;
    use serde_json::json;

    fn vars() -> ExecutionContext {
        ExecutionContext::with_inputs([("count".to_string(), json!("10"))])
    }

    async fn port_for(comparison_type: &str) -> Option<String> {
        run(
            &ConditionalNode,
            json!({
                "field": "count", "operator": "greater_than", "value": "9",
                "comparison_type": comparison_type
            }),
            &vars(),
        )
        .await
        .unwrap()
        .port
    }

    #[tokio::test]
    async fn string_comparison_is_lexicographic() {
        assert_eq!(port_for("string").await.as_deref(), Some(FALSE_PORT));
    }

    #[tokio::test]
    async fn number_comparison_is_numeric() {
        assert_eq!(port_for("number").await.as_deref(), Some(TRUE_PORT));
    }

    #[tokio::test]
    async fn incompatible_declared_type_is_a_type_mismatch() {
        let vars = ExecutionContext::with_inputs([("count".to_string(), json!("ten"))]);
        let err = run(
            &ConditionalNode,
            json!({
                "field": "count", "operator": "greater_than", "value": 9,
                "comparison_type": "number"
            }),
            &vars,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::TypeMismatch(_)));
    }

    #[tokio::test]
    async fn outcome_is_written_when_requested() {
        let out = run(
            &ConditionalNode,
            json!({ "field": "count", "operator": "is_not_empty", "output_key": "has_count" }),
            &vars(),
        )
        .await
        .unwrap();
        assert_eq!(out.writes, vec![ContextWrite::replace("has_count", json!(true))]);
    }
}
