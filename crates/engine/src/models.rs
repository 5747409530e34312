//! Core domain models for the process engine.
//!
//! A [`Process`] is the authored graph; an [`ExecutionRun`] is what one
//! traversal of it leaves behind. Both round-trip through JSON: processes
//! are loaded from definition files, runs are stored in the history store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use uuid::Uuid;

use nodes::{ContextSnapshot, NodeConfig, NodeError, NodeKind};

use crate::binding::{EntityCreationConfig, OutputBinding};
use crate::EngineError;

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the process graph.
///
/// Deserialized from `{ "id", "label", "type", "config" }`; the type tag is
/// checked against the node catalog while loading, so an unknown tag or a
/// missing required field never reaches the orchestrator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawNode")]
pub struct NodeDefinition {
    /// Unique identifier within this process (referenced by edges).
    pub id: String,
    pub label: String,
    pub config: NodeConfig,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, config: NodeConfig) -> Self {
        Self {
            id: id.into(),
            label: String::new(),
            config,
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind()
    }
}

/// Wire shape of a node before its configuration is typed.
#[derive(Debug, Deserialize)]
struct RawNode {
    id: String,
    #[serde(default)]
    label: String,
    #[serde(rename = "type")]
    node_type: String,
    #[serde(default)]
    config: Value,
}

impl TryFrom<RawNode> for NodeDefinition {
    type Error = EngineError;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let config = NodeConfig::from_parts(&raw.node_type, raw.config).map_err(|e| {
            EngineError::NodeConfiguration {
                node_id: raw.id.clone(),
                message: match e {
                    NodeError::Configuration(message) => message,
                    other => other.to_string(),
                },
            }
        })?;
        Ok(Self {
            id: raw.id,
            label: raw.label,
            config,
        })
    }
}

impl Serialize for NodeDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: &'a str,
            #[serde(skip_serializing_if = "is_blank")]
            label: &'a str,
            #[serde(flatten)]
            config: &'a NodeConfig,
        }
        fn is_blank(label: &&str) -> bool {
            label.is_empty()
        }
        Wire {
            id: &self.id,
            label: &self.label,
            config: &self.config,
        }
        .serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Edge
// ---------------------------------------------------------------------------

/// Directed edge from one node to another.
///
/// `source_port` routes conditional nodes (`"true"` / `"false"`) and branch
/// nodes (the branch id). An edge without a port is always taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    #[serde(alias = "from")]
    pub source: String,
    #[serde(alias = "to")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_port: None,
            target_port: None,
        }
    }

    pub fn via(mut self, port: impl Into<String>) -> Self {
        self.source_port = Some(port.into());
        self
    }
}

// ---------------------------------------------------------------------------
// KpiBinding
// ---------------------------------------------------------------------------

/// Declares that a context variable feeds a KPI's current value once the run
/// completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KpiBinding {
    pub kpi_id: String,
    pub variable: String,
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// A complete process definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub kpi_bindings: Vec<KpiBinding>,
    #[serde(default)]
    pub bindings: Vec<OutputBinding>,
    #[serde(default)]
    pub entity_creations: Vec<EntityCreationConfig>,
}

impl Process {
    /// Convenience constructor for tests and programmatic builders.
    pub fn new(id: impl Into<String>, nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            nodes,
            edges,
            kpi_bindings: Vec::new(),
            bindings: Vec::new(),
            entity_creations: Vec::new(),
        }
    }

    /// Parse a process definition document.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidDefinition(e.to_string()))
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Per-node state machine: `pending → running → completed | failed | skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every node completed or was skipped by routing.
    Completed,
    /// At least one node failed.
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running"   => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed"    => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other       => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Outcome of one node within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time from dispatch to settle, including retries.
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// ExecutionRun
// ---------------------------------------------------------------------------

/// The record one traversal of a process leaves behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    pub run_id: Uuid,
    pub process_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Node results in the order they settled.
    pub nodes: Vec<NodeResult>,
    /// Final context, detached from the run.
    pub context: ContextSnapshot,
}

impl ExecutionRun {
    /// The first node to fail, in settle order.
    pub fn first_failure(&self) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.status == NodeStatus::Failed)
    }

    pub fn result(&self, node_id: &str) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn status_of(&self, node_id: &str) -> Option<NodeStatus> {
        self.result(node_id).map(|n| n.status)
    }

    /// Node ids currently in `status`.
    pub fn nodes_in(&self, status: NodeStatus) -> Vec<&str> {
        self.nodes
            .iter()
            .filter(|n| n.status == status)
            .map(|n| n.node_id.as_str())
            .collect()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
