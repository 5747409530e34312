//! Engine-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nodes::NodeKind;

/// Errors produced by the process engine.
///
/// Graph validation errors stop a run before any node executes. Node
/// failures never surface here; they are recorded on the run instead.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Load errors ------

    /// The definition document could not be parsed.
    #[error("invalid process definition: {0}")]
    InvalidDefinition(String),

    /// A node's type tag or configuration was rejected by the catalog.
    #[error("node '{node_id}': {message}")]
    NodeConfiguration { node_id: String, message: String },

    // ------ Graph validation errors ------

    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// An edge references a node ID that doesn't exist in the process.
    #[error("edge {edge} references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference {
        edge: usize,
        node_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("process graph contains a cycle through '{0}'")]
    CycleDetected(String),

    /// An edge leaving a branch node names a branch the node does not declare.
    #[error("edge {edge} leaves branch node '{node_id}' through undeclared branch '{port}'")]
    UnknownBranchPort {
        edge: usize,
        node_id: String,
        port: String,
    },

    /// A declared branch has no outgoing edge.
    #[error("branch '{branch}' of node '{node_id}' has no target")]
    DanglingBranch { node_id: String, branch: String },

    /// A node kind has no executor in the registry.
    #[error("no executor registered for node '{node_id}' of type '{kind}'")]
    MissingExecutor { node_id: String, kind: NodeKind },

    // ------ Runtime errors ------

    /// The run task ended without producing a result.
    #[error("run task aborted: {0}")]
    Aborted(String),

    /// Run export document could not be read.
    #[error("invalid export document: {0}")]
    Export(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error rejects the process graph itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidDefinition(_)
                | Self::NodeConfiguration { .. }
                | Self::DuplicateNodeId(_)
                | Self::UnknownNodeReference { .. }
                | Self::CycleDetected(_)
                | Self::UnknownBranchPort { .. }
                | Self::DanglingBranch { .. }
                | Self::MissingExecutor { .. }
        )
    }
}

/// Why a single output binding or entity creation did not apply.
///
/// Collected in a [`crate::binding::BindingReport`]; never fails a run.
#[derive(Debug, Error, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BindingError {
    #[error("guard evaluation failed: {0}")]
    Guard(String),

    #[error("source value '{0}' is not set")]
    MissingValue(String),

    #[error("destination write failed: {0}")]
    Destination(String),

    /// Entity sink rejected the record.
    #[error("entity sink error: {0}")]
    Sink(String),

    /// The stored binding configuration could not be loaded.
    #[error("binding configuration unavailable: {0}")]
    Config(String),
}
