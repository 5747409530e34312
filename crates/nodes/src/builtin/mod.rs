//! Built-in executors, one per node kind.
//!
//! Branch nodes have no executor: the orchestrator schedules their branches
//! itself.

pub mod conditional;
pub mod entity_binder;
pub mod formula;
pub mod kpi_writer;
pub mod model;
pub mod source;
pub mod state_marker;
pub mod transform;
pub mod webhook;

pub use conditional::ConditionalNode;
pub use entity_binder::EntityBinderNode;
pub use formula::FormulaNode;
pub use kpi_writer::KpiWriterNode;
pub use model::ModelNode;
pub use source::SourceNode;
pub use state_marker::StateMarkerNode;
pub use transform::TransformNode;
pub use webhook::WebhookNode;

#[cfg(test)]
pub(crate) mod testing {
    use serde_json::Value;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::config::NodeConfig;
    use crate::context::ExecutionContext;
    use crate::traits::{ExecutableNode, NodeContext, NodeOutput};
    use crate::NodeError;

    /// Run `node` once against `vars` with a fresh cancellation token.
    pub async fn run(
        node: &dyn ExecutableNode,
        config: Value,
        vars: &ExecutionContext,
    ) -> Result<NodeOutput, NodeError> {
        let tag = node.kind().as_str();
        let config = NodeConfig::from_parts(tag, config)?;
        let cancel = CancellationToken::new();
        let ctx = NodeContext {
            process_id: "proc",
            run_id: Uuid::nil(),
            node_id: "n1",
            variables: vars,
            cancel: &cancel,
        };
        node.execute(&config, &ctx).await
    }
}
