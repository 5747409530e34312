//! Entity-binder node: expose a domain asset's properties and linked record
//! ids as context variables.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::domain::DomainRegistry;
use crate::template::render;
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::NodeError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBinderConfig {
    /// May be a template (`{{selected_asset}}`).
    pub asset_id: String,
    /// Variable prefix; defaults to the node id.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Standard properties to expose; `id` and `name` when empty.
    #[serde(default)]
    pub base_properties: Vec<String>,
    #[serde(default)]
    pub custom_properties: Vec<String>,
    #[serde(default)]
    pub include_risks: bool,
    #[serde(default)]
    pub include_incidents: bool,
    #[serde(default)]
    pub include_defects: bool,
}

pub struct EntityBinderNode {
    domain: Arc<dyn DomainRegistry>,
}

impl EntityBinderNode {
    pub fn new(domain: Arc<dyn DomainRegistry>) -> Self {
        Self { domain }
    }
}

fn ids(list: &[String]) -> Value {
    Value::Array(list.iter().cloned().map(Value::String).collect())
}

#[async_trait]
impl ExecutableNode for EntityBinderNode {
    fn kind(&self) -> NodeKind {
        NodeKind::EntityBinder
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::EntityBinder(cfg) = config else {
            return Err(unexpected_config(NodeKind::EntityBinder, config));
        };
        let asset_id = render(&cfg.asset_id, ctx.variables);
        let asset = self
            .domain
            .asset(&asset_id)
            .await
            .map_err(|e| NodeError::Domain(e.to_string()))?;

        let mut exposed = Map::new();
        let defaults = ["id".to_string(), "name".to_string()];
        let base: &[String] = if cfg.base_properties.is_empty() {
            &defaults
        } else {
            &cfg.base_properties
        };
        for prop in base {
            exposed.insert(prop.clone(), asset.base_property(prop).unwrap_or(Value::Null));
        }
        for prop in &cfg.custom_properties {
            exposed.insert(
                prop.clone(),
                asset.custom_properties.get(prop).cloned().unwrap_or(Value::Null),
            );
        }
        if cfg.include_risks {
            exposed.insert("risk_ids".into(), ids(&asset.risk_ids));
        }
        if cfg.include_incidents {
            exposed.insert("incident_ids".into(), ids(&asset.incident_ids));
        }
        if cfg.include_defects {
            exposed.insert("defect_ids".into(), ids(&asset.defect_ids));
        }

        let prefix = cfg.prefix.as_deref().unwrap_or(ctx.node_id);
        let writes = exposed
            .iter()
            .map(|(k, v)| ContextWrite::replace(format!("{prefix}.{k}"), v.clone()))
            .collect();
        Ok(NodeOutput {
            value: Value::Object(exposed),
            writes,
            port: None,
        })
    }
}
