//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// A node error fails that node only; the orchestrator decides what happens
/// to its successors. Only [`NodeError::Network`] with `retryable: true` is
/// ever retried, and only by integration-style executors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    /// Malformed or incomplete node configuration.
    #[error("node configuration error: {0}")]
    Configuration(String),

    /// A value did not have the type a contract required.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// HTTP / model transport failure.
    #[error("network error: {message}")]
    Network { message: String, retryable: bool },

    /// Formula rejected by syntax validation before evaluation.
    #[error("formula syntax error: {0}")]
    FormulaSyntax(String),

    /// Formula evaluation failed (unknown variable, domain error, ...).
    #[error("formula evaluation error: {0}")]
    FormulaEval(String),

    /// Input payload could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Model invocation failed or returned an unusable response.
    #[error("model error: {0}")]
    Model(String),

    /// Domain registry lookup or write failed.
    #[error("domain registry error: {0}")]
    Domain(String),

    /// Enrichment lookup missed under the `error` policy.
    #[error("lookup miss: {0}")]
    LookupMiss(String),

    /// A branch node could not settle (no race winner, conflicting writes).
    #[error("branch error: {0}")]
    Branch(String),

    /// The run was cancelled while the node was in flight.
    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn network(msg: impl Into<String>, retryable: bool) -> Self {
        Self::Network {
            message: msg.into(),
            retryable,
        }
    }

    /// Whether a retry policy may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { retryable: true, .. })
    }
}

impl From<crate::context::ContextError> for NodeError {
    fn from(err: crate::context::ContextError) -> Self {
        Self::TypeMismatch(err.to_string())
    }
}
