//! Test doubles: `MockNode` for `ExecutableNode`, `MockTransport` for
//! `HttpTransport` and `MockModelClient` for `ModelClient`.
//!
//! Useful in unit and integration tests where real I/O is either unavailable
//! or irrelevant.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::{NodeConfig, NodeKind};
use crate::context::ContextWrite;
use crate::model::{ModelClient, ModelRequest};
use crate::traits::{ExecutableNode, NodeContext, NodeOutput};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use crate::NodeError;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// MockNode
// ---------------------------------------------------------------------------

/// Behaviour injected into `MockNode`, per node id or as a default.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Return a specific JSON value (also written to the config's output key).
    ReturnValue(Value),
    /// Fail with the given error.
    Fail(NodeError),
    /// Sleep, then return the value. Cancellation interrupts the sleep.
    Delayed(Duration, Value),
    /// Never finish on its own; only cancellation ends it.
    Hang,
}

/// A mock executor that records every node it runs and returns a
/// programmer-specified result.
pub struct MockNode {
    kind: NodeKind,
    default: MockBehaviour,
    per_node: HashMap<String, MockBehaviour>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl MockNode {
    /// A mock standing in for `kind`, echoing `{ "node": <id> }` by default.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            default: MockBehaviour::ReturnValue(Value::Null),
            per_node: HashMap::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn returning(kind: NodeKind, value: Value) -> Self {
        Self::new(kind).by_default(MockBehaviour::ReturnValue(value))
    }

    pub fn by_default(mut self, behaviour: MockBehaviour) -> Self {
        self.default = behaviour;
        self
    }

    /// Override the behaviour for one node id.
    pub fn on(mut self, node_id: impl Into<String>, behaviour: MockBehaviour) -> Self {
        self.per_node.insert(node_id.into(), behaviour);
        self
    }

    /// Shared handle on the call log, usable after the mock is moved into a
    /// registry.
    pub fn call_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.calls)
    }

    /// Node ids executed so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of times this mock has been executed.
    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

fn output_for(node_id: &str, config: &NodeConfig, value: Value) -> NodeOutput {
    let value = if value.is_null() {
        json!({ "node": node_id })
    } else {
        value
    };
    let mut out = NodeOutput::new(value.clone());
    if let Some(key) = config.output_key() {
        out.writes.push(ContextWrite::replace(key, value));
    }
    out
}

#[async_trait]
impl ExecutableNode for MockNode {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError> {
        lock(&self.calls).push(ctx.node_id.to_string());
        let behaviour = self
            .per_node
            .get(ctx.node_id)
            .unwrap_or(&self.default)
            .clone();

        match behaviour {
            MockBehaviour::ReturnValue(v) => Ok(output_for(ctx.node_id, config, v)),
            MockBehaviour::Fail(err) => Err(err),
            MockBehaviour::Delayed(delay, v) => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => Err(NodeError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(output_for(ctx.node_id, config, v)),
                }
            }
            MockBehaviour::Hang => {
                ctx.cancel.cancelled().await;
                Err(NodeError::Cancelled)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MockReply {
    Response(HttpResponse),
    NetworkError(String),
}

/// Scripted HTTP transport. Replies are consumed in order and the last one
/// repeats; with no script every request gets `200 {}`.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_json(self, status: u16, body: Value) -> Self {
        self.push(MockReply::Response(HttpResponse {
            status,
            headers: BTreeMap::from([("content-type".to_string(), "application/json".to_string())]),
            body: body.to_string(),
        }))
    }

    pub fn respond_text(self, status: u16, body: impl Into<String>) -> Self {
        self.push(MockReply::Response(HttpResponse {
            status,
            headers: BTreeMap::new(),
            body: body.into(),
        }))
    }

    pub fn respond_status(self, status: u16) -> Self {
        self.respond_text(status, "")
    }

    /// A retryable transport-level failure.
    pub fn fail_network(self, message: impl Into<String>) -> Self {
        self.push(MockReply::NetworkError(message.into()))
    }

    /// Delay every reply (observes tokio's paused clock in tests).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    fn push(self, reply: MockReply) -> Self {
        lock(&self.script).push_back(reply);
        self
    }

    fn next_reply(&self) -> Option<MockReply> {
        let mut script = lock(&self.script);
        if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        }
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, NodeError> {
        lock(&self.requests).push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_reply() {
            Some(MockReply::Response(r)) => Ok(r),
            Some(MockReply::NetworkError(msg)) => Err(NodeError::network(msg, true)),
            None => Ok(HttpResponse {
                status: 200,
                headers: BTreeMap::new(),
                body: "{}".into(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockModelClient
// ---------------------------------------------------------------------------

/// Scripted model client with the same consume-then-repeat rule as
/// [`MockTransport`]. Defaults to replying `"ok"`.
#[derive(Debug, Default)]
pub struct MockModelClient {
    script: Mutex<VecDeque<Result<String, NodeError>>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockModelClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: impl Into<String>) -> Self {
        lock(&self.script).push_back(Ok(text.into()));
        self
    }

    pub fn fail(self, err: NodeError) -> Self {
        lock(&self.script).push_back(Err(err));
        self
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn complete(&self, request: ModelRequest) -> Result<String, NodeError> {
        lock(&self.requests).push(request);
        let mut script = lock(&self.script);
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| Ok("ok".to_string()))
    }
}
