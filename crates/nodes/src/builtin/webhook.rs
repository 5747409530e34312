//! Webhook node: an authenticated HTTP call under a retry policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::AuthConfig;
use crate::config::{NodeConfig, NodeKind};
use crate::context::ExecutionContext;
use crate::retry::{with_retry, RetryPolicy};
use crate::template::{render, render_value};
use crate::traits::{unexpected_config, ExecutableNode, NodeContext, NodeOutput};
use crate::transport::{
    is_retryable_status, HttpMethod, HttpRequest, HttpResponse, HttpTransport, RequestBody,
};
use crate::value::to_display_string;
use crate::NodeError;

/// Request content type; drives body serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json", alias = "json")]
    Json,
    #[serde(rename = "application/x-www-form-urlencoded", alias = "form")]
    Form,
    #[serde(rename = "text/plain", alias = "text")]
    Text,
    #[serde(rename = "application/xml", alias = "xml")]
    Xml,
}

impl ContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Form => "application/x-www-form-urlencoded",
            Self::Text => "text/plain",
            Self::Xml => "application/xml",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub content_type: ContentType,
    /// Body template; strings inside are rendered against the context.
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub output_key: String,
    /// Store only the parsed body instead of `{status, headers, body}`.
    #[serde(default)]
    pub extract_body: bool,
}

pub struct WebhookNode {
    transport: Arc<dyn HttpTransport>,
}

impl WebhookNode {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }
}

fn build_body(cfg: &WebhookConfig, vars: &ExecutionContext) -> Result<Option<RequestBody>, NodeError> {
    let Some(template) = &cfg.body else {
        return Ok(None);
    };
    let rendered = render_value(template, vars);
    let body = match cfg.content_type {
        ContentType::Json => RequestBody::Json(rendered),
        ContentType::Form => {
            let Value::Object(map) = rendered else {
                return Err(NodeError::config("form bodies must be objects"));
            };
            RequestBody::Form(
                map.iter()
                    .map(|(k, v)| (k.clone(), to_display_string(v)))
                    .collect(),
            )
        }
        ContentType::Text | ContentType::Xml => RequestBody::Text {
            content_type: cfg.content_type.mime().to_string(),
            content: match rendered {
                Value::String(s) => s,
                other => other.to_string(),
            },
        },
    };
    Ok(Some(body))
}

/// Render the request from configuration and context (credentials excluded).
pub fn build_request(cfg: &WebhookConfig, vars: &ExecutionContext) -> Result<HttpRequest, NodeError> {
    let url = render(&cfg.url, vars);
    if url.trim().is_empty() {
        return Err(NodeError::config("webhook url renders empty"));
    }
    let mut request = HttpRequest::new(cfg.method, url);
    for (k, v) in &cfg.headers {
        request = request.header(k.clone(), render(v, vars));
    }
    request.query = cfg
        .query
        .iter()
        .map(|(k, v)| (k.clone(), render(v, vars)))
        .collect();
    request.body = build_body(cfg, vars)?;
    request.timeout = cfg.timeout_ms.map(Duration::from_millis);
    Ok(request)
}

fn response_value(response: &HttpResponse, extract_body: bool) -> Value {
    if extract_body {
        return response.body_value();
    }
    json!({
        "status": response.status,
        "headers": response.headers,
        "body": response.body_value(),
    })
}

#[async_trait]
impl ExecutableNode for WebhookNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Webhook
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        let NodeConfig::Webhook(cfg) = config else {
            return Err(unexpected_config(NodeKind::Webhook, config));
        };
        let request = build_request(cfg, ctx.variables)?;
        let auth = cfg.auth.map_strings(|s| render(s, ctx.variables));
        let transport = self.transport.as_ref();
        let started = Instant::now();

        let (result, attempts) = with_retry(&cfg.retry, ctx.cancel, ctx.node_id, |_| {
            let request = request.clone();
            let auth = &auth;
            async move {
                let request = auth.apply(request, transport).await?;
                let response = transport.send(request).await?;
                if !response.is_success() {
                    return Err(NodeError::network(
                        format!("HTTP {}", response.status),
                        is_retryable_status(response.status),
                    ));
                }
                Ok(response)
            }
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => {
                info!(
                    node_id = ctx.node_id,
                    status = response.status,
                    attempts,
                    elapsed_ms,
                    "webhook call succeeded"
                );
                Ok(NodeOutput::stored(
                    cfg.output_key.clone(),
                    response_value(&response, cfg.extract_body),
                ))
            }
            Err(err) => {
                warn!(node_id = ctx.node_id, attempts, elapsed_ms, error = %err, "webhook call failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::testing::run;
    use crate::mock::MockTransport;

    fn config(extra: Value) -> Value {
        let mut base = json!({
            "url": "http://svc/{{tenant}}/events",
            "method": "POST",
            "output_key": "resp",
            "retry": { "max_attempts": 3, "delay": "fixed", "initial_delay_ms": 10 }
        });
        if let (Some(b), Value::Object(e)) = (base.as_object_mut(), extra) {
            b.extend(e);
        }
        base
    }

    fn vars() -> ExecutionContext {
        ExecutionContext::with_inputs([
            ("tenant".to_string(), json!("acme")),
            ("score".to_string(), json!(42)),
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn failing_endpoint_is_tried_exactly_max_attempts_times() {
        let transport = Arc::new(MockTransport::new().respond_status(503));
        let node = WebhookNode::new(transport.clone());
        let err = run(&node, config(json!({})), &vars()).await.unwrap_err();
        assert!(matches!(err, NodeError::Network { .. }));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn late_success_after_retries() {
        let transport = Arc::new(
            MockTransport::new()
                .fail_network("connection reset")
                .respond_status(502)
                .respond_json(200, json!({ "ok": true })),
        );
        let node = WebhookNode::new(transport.clone());
        let out = run(&node, config(json!({ "extract_body": true })), &vars())
            .await
            .unwrap();
        assert_eq!(out.value, json!({ "ok": true }));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let transport = Arc::new(MockTransport::new().respond_status(404));
        let node = WebhookNode::new(transport.clone());
        assert!(run(&node, config(json!({})), &vars()).await.is_err());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn templates_render_into_url_and_body() {
        let transport = Arc::new(MockTransport::new());
        let node = WebhookNode::new(transport.clone());
        run(
            &node,
            config(json!({
                "body": { "score": "{{score}}", "note": "tenant {{tenant}}" },
                "auth": { "type": "bearer", "token": "t-{{tenant}}" }
            })),
            &vars(),
        )
        .await
        .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "http://svc/acme/events");
        assert_eq!(sent.header_value("authorization"), Some("Bearer t-acme"));
        assert_eq!(
            sent.body,
            Some(RequestBody::Json(json!({ "score": 42, "note": "tenant acme" })))
        );
    }

    #[tokio::test]
    async fn form_content_type_serializes_pairs() {
        let transport = Arc::new(MockTransport::new());
        let node = WebhookNode::new(transport.clone());
        run(
            &node,
            config(json!({
                "content_type": "application/x-www-form-urlencoded",
                "body": { "score": "{{score}}" }
            })),
            &vars(),
        )
        .await
        .unwrap();
        assert_eq!(
            transport.requests()[0].body,
            Some(RequestBody::Form(vec![("score".into(), "42".into())]))
        );
    }
}
