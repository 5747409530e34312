//! `nodes` crate: the `ExecutableNode` trait, typed node configuration and
//! the built-in executors.
//!
//! Every executor implements [`ExecutableNode`]. The engine crate looks
//! executors up in a [`NodeRegistry`] by [`NodeKind`] and threads an
//! [`ExecutionContext`] between them.

pub mod auth;
pub mod builtin;
pub mod condition;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod formula;
pub mod mock;
pub mod model;
pub mod registry;
pub mod retry;
pub mod template;
pub mod traits;
pub mod transform;
pub mod transport;
pub mod value;

pub use condition::{Condition, ConditionGroup, FieldSource};
pub use config::{BranchConfig, BranchSpec, BranchStrategy, NodeConfig, NodeKind, ValueSource};
pub use context::{ContextError, ContextSnapshot, ContextWrite, ExecutionContext, WriteMode};
pub use error::NodeError;
pub use registry::{NodeRegistry, Services};
pub use retry::RetryPolicy;
pub use traits::{ExecutableNode, NodeContext, NodeOutput};
