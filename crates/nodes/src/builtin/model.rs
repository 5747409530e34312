//! Model-invocation node: render a prompt template and call an LLM/ML
//! endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::config::{NodeConfig, NodeKind};
use crate::model::{parse_json_reply, ModelClient, ModelRequest, DEFAULT_CHAT_ENDPOINT};
use crate::retry::{with_retry, RetryPolicy};
use crate::template::render;
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::NodeError;

fn default_endpoint() -> String {
    DEFAULT_CHAT_ENDPOINT.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    pub model: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub response_format: ResponseFormat,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    pub output_key: String,
    /// Absent means a single attempt.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

pub struct ModelNode {
    client: Arc<dyn ModelClient>,
}

impl ModelNode {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExecutableNode for ModelNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Model
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Model(cfg) = config else {
            return Err(unexpected_config(NodeKind::Model, config));
        };

        let api_key = match &cfg.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                NodeError::config(format!("environment variable '{var}' is not set"))
            })?),
            None => None,
        };
        let request = ModelRequest {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            system_prompt: cfg.system_prompt.as_deref().map(|s| render(s, ctx.variables)),
            prompt: render(&cfg.prompt_template, ctx.variables),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            json_response: cfg.response_format == ResponseFormat::Json,
            api_key,
        };

        let policy = cfg.retry.clone().unwrap_or_else(RetryPolicy::none);
        let client = self.client.as_ref();
        let (reply, attempts) = with_retry(&policy, ctx.cancel, ctx.node_id, |_| {
            client.complete(request.clone())
        })
        .await;
        let reply = reply?;
        info!(node_id = ctx.node_id, model = %cfg.model, attempts, "model replied");

        let value = match cfg.response_format {
            ResponseFormat::Text => Value::String(reply),
            ResponseFormat::Json => parse_json_reply(&reply)?,
        };
        Ok(NodeOutput::stored(cfg.output_key.clone(), value))
    }
}
