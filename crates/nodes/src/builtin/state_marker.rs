//! State-marker node: tag the run with a named state and severity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::template::render;
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Error,
    Pending,
    #[default]
    Info,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMarkerConfig {
    pub state: String,
    #[serde(default)]
    pub severity: Severity,
    /// Template rendered against the context.
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub output_key: Option<String>,
}

pub struct StateMarkerNode;

#[async_trait]
impl ExecutableNode for StateMarkerNode {
    fn kind(&self) -> NodeKind {
        NodeKind::StateMarker
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::StateMarker(cfg) = config else {
            return Err(unexpected_config(NodeKind::StateMarker, config));
        };
        let message = cfg
            .message
            .as_deref()
            .map(|m| render(m, ctx.variables))
            .unwrap_or_default();

        match cfg.severity {
            Severity::Error => error!(node_id = ctx.node_id, state = %cfg.state, %message, "state marked"),
            Severity::Warning => warn!(node_id = ctx.node_id, state = %cfg.state, %message, "state marked"),
            _ => info!(node_id = ctx.node_id, state = %cfg.state, severity = ?cfg.severity, %message, "state marked"),
        }

        let value = json!({ "state": cfg.state, "severity": cfg.severity, "message": message });
        let mut out = NodeOutput::new(value.clone());
        if let Some(key) = &cfg.output_key {
            out = out.with_write(ContextWrite::replace(key.clone(), value));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::context::ExecutionContext;

    #[tokio::test]
    async fn marker_renders_message_and_severity() {
        let vars = ExecutionContext::with_inputs([("score".to_string(), json!(81))]);
        let out = run(
            &StateMarkerNode,
            json!({
                "state": "reviewed", "severity": "warning",
                "message": "score {{score}}", "output_key": "status"
            }),
            &vars,
        )
        .await
        .unwrap();
        assert_eq!(
            out.value,
            json!({ "state": "reviewed", "severity": "warning", "message": "score 81" })
        );
        assert_eq!(out.writes[0].key, "status");
    }
}
