//! The `ExecutableNode` trait, the contract every node executor fulfils.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{NodeConfig, NodeKind};
use crate::context::{ContextWrite, ExecutionContext};
use crate::NodeError;

/// Read-only view handed to an executor for one node execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub process_id: &'a str,
    pub run_id: Uuid,
    pub node_id: &'a str,
    /// Variables visible to this node. Writes go through [`NodeOutput`].
    pub variables: &'a ExecutionContext,
    /// Run-scoped cancellation flag; network calls observe it.
    pub cancel: &'a CancellationToken,
}

/// What a node hands back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeOutput {
    /// Stored on the node result.
    pub value: Value,
    /// Context writes, applied atomically on completion.
    pub writes: Vec<ContextWrite>,
    /// Outgoing port taken, for routing nodes (`"true"` / `"false"`).
    pub port: Option<String>,
}

impl NodeOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    /// Value plus a replace-write of the same value under `key`.
    pub fn stored(key: impl Into<String>, value: Value) -> Self {
        Self {
            writes: vec![ContextWrite::replace(key, value.clone())],
            value,
            port: None,
        }
    }

    pub fn with_write(mut self, write: ContextWrite) -> Self {
        self.writes.push(write);
        self
    }

    pub fn via_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }
}

/// The core node trait.
///
/// All built-in executors implement this. The orchestrator looks the
/// executor up by the node's [`NodeKind`] and never matches on type tags
/// itself.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Execute one node. `config` always carries this executor's variant.
    async fn execute(
        &self,
        config: &NodeConfig,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutput, NodeError>;
}

/// Shared "wrong variant" error for executors.
pub(crate) fn unexpected_config(expected: NodeKind, got: &NodeConfig) -> NodeError {
    NodeError::config(format!(
        "{expected} executor received a '{}' configuration",
        got.kind()
    ))
}
