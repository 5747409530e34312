//! KPI-writer node: record a value against a KPI, with an optional threshold
//! alert.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::config::{NodeConfig, NodeKind, ValueSource};
use crate::context::{ContextWrite, WriteMode};
use crate::domain::{DomainRegistry, DomainTarget};
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::value::{as_number, number};
use crate::NodeError;

/// Which side of the threshold raises an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdDirection {
    Below,
    Above,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiWriterConfig {
    pub kpi_id: String,
    pub value: ValueSource,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub direction: Option<ThresholdDirection>,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub output_key: Option<String>,
}

impl KpiWriterConfig {
    pub fn alert(&self, value: f64) -> bool {
        match (self.threshold, self.direction) {
            (Some(t), Some(ThresholdDirection::Below)) => value < t,
            (Some(t), Some(ThresholdDirection::Above)) => value > t,
            _ => false,
        }
    }
}

pub struct KpiWriterNode {
    domain: Arc<dyn DomainRegistry>,
}

impl KpiWriterNode {
    pub fn new(domain: Arc<dyn DomainRegistry>) -> Self {
        Self { domain }
    }
}

#[async_trait]
impl ExecutableNode for KpiWriterNode {
    fn kind(&self) -> NodeKind {
        NodeKind::KpiWriter
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::KpiWriter(cfg) = config else {
            return Err(unexpected_config(NodeKind::KpiWriter, config));
        };
        let raw = cfg
            .value
            .resolve(ctx.variables)
            .ok_or_else(|| NodeError::TypeMismatch(format!("KPI '{}' has no value", cfg.kpi_id)))?;
        let value = as_number(&raw).ok_or_else(|| {
            NodeError::TypeMismatch(format!("KPI '{}' value is not numeric: {raw}", cfg.kpi_id))
        })?;

        self.domain
            .write(
                &DomainTarget::Kpi {
                    kpi_id: cfg.kpi_id.clone(),
                },
                number(value),
                cfg.mode,
            )
            .await
            .map_err(|e| NodeError::Domain(e.to_string()))?;

        let alert = cfg.alert(value);
        if alert {
            warn!(node_id = ctx.node_id, kpi_id = %cfg.kpi_id, value, threshold = ?cfg.threshold, "KPI threshold crossed");
        } else {
            info!(node_id = ctx.node_id, kpi_id = %cfg.kpi_id, value, "KPI recorded");
        }

        let result = json!({
            "kpi_id": cfg.kpi_id,
            "value": number(value),
            "threshold": cfg.threshold,
            "direction": cfg.direction,
            "alert": alert,
        });
        let mut out = NodeOutput::new(result.clone());
        if let Some(key) = &cfg.output_key {
            out = out.with_write(ContextWrite::replace(key.clone(), result));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::context::ExecutionContext;
    use crate::domain::InMemoryDomain;

    #[tokio::test]
    async fn below_threshold_raises_alert_and_writes_kpi() {
        let domain = Arc::new(InMemoryDomain::new());
        let node = KpiWriterNode::new(domain.clone());
        let vars = ExecutionContext::with_inputs([("uptime".to_string(), json!("97.5"))]);
        let out = run(
            &node,
            json!({
                "kpi_id": "k-uptime",
                "value": { "from": "variable", "key": "uptime" },
                "threshold": 99.0, "direction": "below"
            }),
            &vars,
        )
        .await
        .unwrap();
        assert_eq!(out.value["alert"], true);
        assert_eq!(
            domain.value_at(&DomainTarget::Kpi {
                kpi_id: "k-uptime".into()
            }),
            Some(json!(97.5))
        );
    }

    #[tokio::test]
    async fn non_numeric_value_is_a_type_mismatch() {
        let node = KpiWriterNode::new(Arc::new(InMemoryDomain::new()));
        let err = run(
            &node,
            json!({ "kpi_id": "k", "value": { "from": "literal", "value": "n/a" } }),
            &ExecutionContext::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NodeError::TypeMismatch(_)));
    }
}
