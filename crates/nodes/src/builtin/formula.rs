//! Formula node: arithmetic over named numeric variables.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::formula::{round_to, Formula};
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::value::{as_number, number};
use crate::NodeError;

fn default_precision() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaConfig {
    pub expression: String,
    /// Formula variable → context key. Unmapped identifiers are looked up in
    /// the context under their own name.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Decimal places of the stored result.
    #[serde(default = "default_precision")]
    pub precision: u32,
    pub output_key: String,
}

pub struct FormulaNode;

#[async_trait]
impl ExecutableNode for FormulaNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Formula
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Formula(cfg) = config else {
            return Err(unexpected_config(NodeKind::Formula, config));
        };
        // Syntax errors surface here, before any variable is read.
        let formula = Formula::parse(&cfg.expression)?;

        for name in formula.variables() {
            let key = cfg.variables.get(&name).unwrap_or(&name);
            match ctx.variables.resolve(key) {
                None => {
                    return Err(NodeError::FormulaEval(format!(
                        "variable '{name}' (context key '{key}') is not set"
                    )))
                }
                Some(v) if as_number(v).is_none() => {
                    return Err(NodeError::TypeMismatch(format!(
                        "variable '{name}' is not numeric: {v}"
                    )))
                }
                Some(_) => {}
            }
        }

        let raw = formula.evaluate(&|name: &str| {
            let key = cfg.variables.get(name).map(String::as_str).unwrap_or(name);
            ctx.variables.resolve(key).and_then(as_number)
        })?;
        let value = round_to(raw, cfg.precision);
        debug!(node_id = ctx.node_id, expression = %cfg.expression, value, "formula evaluated");

        let stored = number(value);
        Ok(NodeOutput {
            value: json!({
                "value": stored,
                "formatted": format!("{:.*}", cfg.precision as usize, value),
            }),
            writes: vec![ContextWrite::replace(cfg.output_key.clone(), stored)],
            port: None,
        })
    }
}
