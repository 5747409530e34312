//! `engine` crate: process models, graph validation and planning, the
//! orchestrator, output bindings and run history.

pub mod binding;
pub mod dag;
pub mod error;
pub mod executor;
pub mod export;
pub mod history;
pub mod models;

pub use binding::{BindingConfig, BindingReport, OutputBinding, OutputBindingResolver};
pub use dag::{validate_dag, ExecutionPlan};
pub use error::{BindingError, EngineError};
pub use executor::{EngineConfig, HistoryBackend, ProcessExecutor, RunHandle, RunOutcome};
pub use history::RunHistory;
pub use models::{Edge, ExecutionRun, KpiBinding, NodeDefinition, NodeResult, NodeStatus, Process, RunStatus};
