//! Node-type catalog: the closed set of type tags and their configuration
//! shapes.
//!
//! A node's configuration is a tagged variant: the tag fixes both the shape
//! and the executor. Unknown tags and missing required fields are rejected
//! when a process is loaded, never at execution time.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::builtin::{
    conditional::ConditionalConfig, entity_binder::EntityBinderConfig, formula::FormulaConfig,
    kpi_writer::KpiWriterConfig, model::ModelConfig, source::SourceConfig,
    state_marker::StateMarkerConfig, transform::TransformConfig, webhook::WebhookConfig,
};
use crate::condition::{ConditionGroup, FieldSource};
use crate::error::NodeError;

/// Type tag of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Webhook,
    Transform,
    Conditional,
    Branch,
    Formula,
    Model,
    StateMarker,
    KpiWriter,
    EntityBinder,
}

/// Schema summary for one node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindSchema {
    pub kind: NodeKind,
    pub description: &'static str,
    /// Top-level configuration fields that must be present.
    pub required: &'static [&'static str],
}

const CATALOG: &[KindSchema] = &[
    KindSchema {
        kind: NodeKind::Source,
        description: "load tabular or domain-record data into the context",
        required: &["output_key", "source"],
    },
    KindSchema {
        kind: NodeKind::Webhook,
        description: "HTTP call with auth and retry",
        required: &["url", "output_key"],
    },
    KindSchema {
        kind: NodeKind::Transform,
        description: "record transformation (filter, sort, aggregate, ...)",
        required: &["input_key", "output_key", "operation"],
    },
    KindSchema {
        kind: NodeKind::Conditional,
        description: "typed comparison routing to the true/false port",
        required: &["field", "operator"],
    },
    KindSchema {
        kind: NodeKind::Branch,
        description: "fan-out under a branching strategy",
        required: &["strategy", "branches"],
    },
    KindSchema {
        kind: NodeKind::Formula,
        description: "arithmetic formula over numeric variables",
        required: &["expression", "output_key"],
    },
    KindSchema {
        kind: NodeKind::Model,
        description: "LLM/ML invocation with a prompt template",
        required: &["model", "prompt_template", "output_key"],
    },
    KindSchema {
        kind: NodeKind::StateMarker,
        description: "named state with a severity tag",
        required: &["state"],
    },
    KindSchema {
        kind: NodeKind::KpiWriter,
        description: "record a KPI value with optional threshold alert",
        required: &["kpi_id", "value"],
    },
    KindSchema {
        kind: NodeKind::EntityBinder,
        description: "expose asset properties and linked records",
        required: &["asset_id"],
    },
];

impl NodeKind {
    pub const ALL: [NodeKind; 10] = [
        NodeKind::Source,
        NodeKind::Webhook,
        NodeKind::Transform,
        NodeKind::Conditional,
        NodeKind::Branch,
        NodeKind::Formula,
        NodeKind::Model,
        NodeKind::StateMarker,
        NodeKind::KpiWriter,
        NodeKind::EntityBinder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Webhook => "webhook",
            Self::Transform => "transform",
            Self::Conditional => "conditional",
            Self::Branch => "branch",
            Self::Formula => "formula",
            Self::Model => "model",
            Self::StateMarker => "state_marker",
            Self::KpiWriter => "kpi_writer",
            Self::EntityBinder => "entity_binder",
        }
    }

    /// Resolve a type tag, accepting the editor's legacy aliases.
    pub fn from_tag(tag: &str) -> Option<Self> {
        let kind = match tag {
            "source" | "data" => Self::Source,
            "webhook" | "integration" => Self::Webhook,
            "transform" => Self::Transform,
            "conditional" | "condition" => Self::Conditional,
            "branch" => Self::Branch,
            "formula" => Self::Formula,
            "model" | "llm" | "ml" => Self::Model,
            "state_marker" | "state" => Self::StateMarker,
            "kpi_writer" | "kpi" => Self::KpiWriter,
            "entity_binder" | "asset_binding" => Self::EntityBinder,
            _ => return None,
        };
        Some(kind)
    }

    pub fn schema(&self) -> &'static KindSchema {
        CATALOG
            .iter()
            .find(|s| s.kind == *self)
            .unwrap_or(&CATALOG[0])
    }

    /// Integration-style kinds block on network I/O.
    pub fn is_network_bound(&self) -> bool {
        matches!(self, Self::Webhook | Self::Model)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The full catalog, in declaration order.
pub fn catalog() -> &'static [KindSchema] {
    CATALOG
}

/// Branching strategy of a branch node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStrategy {
    /// Branches run one after the other in declared order.
    #[serde(alias = "sequential")]
    Secuencial,
    /// All branches run concurrently; completion waits for all of them.
    #[serde(alias = "parallel")]
    Paralela,
    /// All branches run concurrently; the first to complete wins.
    Race,
    /// The first branch whose guard holds runs exclusively.
    #[serde(alias = "priority")]
    Prioridad,
}

/// One declared branch of a branch node. Edges leaving the branch node with
/// `source_port == id` lead to the branch's entry nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub id: String,
    #[serde(default)]
    pub label: Option<String>,
    /// A false guard skips the branch; `prioridad` keeps only the first open one.
    #[serde(default)]
    pub guard: Option<ConditionGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchConfig {
    pub strategy: BranchStrategy,
    pub branches: Vec<BranchSpec>,
}

/// A value read either from the context or given literally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum ValueSource {
    Variable { key: String },
    Literal { value: Value },
}

impl ValueSource {
    pub fn resolve<S: FieldSource + ?Sized>(&self, source: &S) -> Option<Value> {
        match self {
            Self::Variable { key } => source.field(key).cloned(),
            Self::Literal { value } => Some(value.clone()),
        }
    }
}

/// Typed configuration, one variant per node kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum NodeConfig {
    Source(SourceConfig),
    Webhook(WebhookConfig),
    Transform(TransformConfig),
    Conditional(ConditionalConfig),
    Branch(BranchConfig),
    Formula(FormulaConfig),
    Model(ModelConfig),
    StateMarker(StateMarkerConfig),
    KpiWriter(KpiWriterConfig),
    EntityBinder(EntityBinderConfig),
}

impl NodeConfig {
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Source(_) => NodeKind::Source,
            Self::Webhook(_) => NodeKind::Webhook,
            Self::Transform(_) => NodeKind::Transform,
            Self::Conditional(_) => NodeKind::Conditional,
            Self::Branch(_) => NodeKind::Branch,
            Self::Formula(_) => NodeKind::Formula,
            Self::Model(_) => NodeKind::Model,
            Self::StateMarker(_) => NodeKind::StateMarker,
            Self::KpiWriter(_) => NodeKind::KpiWriter,
            Self::EntityBinder(_) => NodeKind::EntityBinder,
        }
    }

    /// Build a typed configuration from a raw tag and payload.
    ///
    /// The tag is checked against the catalog, then required top-level
    /// fields, then the full shape. Unknown payload fields are ignored.
    pub fn from_parts(tag: &str, payload: Value) -> Result<Self, NodeError> {
        let kind = NodeKind::from_tag(tag)
            .ok_or_else(|| NodeError::config(format!("unknown node type '{tag}'")))?;
        let payload = match payload {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        let Value::Object(map) = &payload else {
            return Err(NodeError::config(format!(
                "configuration for '{kind}' must be an object"
            )));
        };
        let missing: Vec<&str> = kind
            .schema()
            .required
            .iter()
            .copied()
            .filter(|f| !map.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(NodeError::config(format!(
                "'{kind}' configuration is missing required field(s): {}",
                missing.join(", ")
            )));
        }
        serde_json::from_value(serde_json::json!({ "type": kind.as_str(), "config": payload }))
            .map_err(|e| NodeError::config(format!("invalid '{kind}' configuration: {e}")))
    }

    /// Context key this node writes its primary output to, if any.
    pub fn output_key(&self) -> Option<&str> {
        match self {
            Self::Source(c) => Some(&c.output_key),
            Self::Webhook(c) => Some(&c.output_key),
            Self::Transform(c) => Some(&c.output_key),
            Self::Conditional(c) => c.output_key.as_deref(),
            Self::Branch(_) => None,
            Self::Formula(c) => Some(&c.output_key),
            Self::Model(c) => Some(&c.output_key),
            Self::StateMarker(c) => c.output_key.as_deref(),
            Self::KpiWriter(c) => c.output_key.as_deref(),
            Self::EntityBinder(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_tag_is_rejected() {
        let err = NodeConfig::from_parts("teleport", json!({})).unwrap_err();
        assert_eq!(err, NodeError::config("unknown node type 'teleport'"));
    }

    #[test]
    fn missing_required_field_is_named() {
        let err = NodeConfig::from_parts("formula", json!({ "expression": "1+1" })).unwrap_err();
        assert!(matches!(&err, NodeError::Configuration(msg) if msg.contains("output_key")), "{err}");
    }

    #[test]
    fn malformed_payloads_are_configuration_errors() {
        let err = NodeConfig::from_parts("state_marker", json!([1, 2])).unwrap_err();
        assert!(matches!(&err, NodeError::Configuration(msg) if msg.contains("must be an object")));
        let err = NodeConfig::from_parts("branch", json!({ "strategy": "zigzag", "branches": [] }))
            .unwrap_err();
        assert!(matches!(&err, NodeError::Configuration(msg) if msg.contains("invalid 'branch'")));
    }

    #[test]
    fn aliases_resolve_to_canonical_kinds() {
        let cfg = NodeConfig::from_parts(
            "llm",
            json!({ "model": "m", "prompt_template": "hi", "output_key": "reply" }),
        )
        .unwrap();
        assert_eq!(cfg.kind(), NodeKind::Model);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let cfg = NodeConfig::from_parts(
            "state_marker",
            json!({ "state": "done", "severity": "success", "color": "green" }),
        )
        .unwrap();
        assert_eq!(cfg.kind(), NodeKind::StateMarker);
    }

    #[test]
    fn branch_strategy_accepts_both_spellings() {
        let s: BranchStrategy = serde_json::from_value(json!("paralela")).unwrap();
        assert_eq!(s, BranchStrategy::Paralela);
        let s: BranchStrategy = serde_json::from_value(json!("priority")).unwrap();
        assert_eq!(s, BranchStrategy::Prioridad);
    }

    #[test]
    fn every_kind_has_a_schema() {
        for kind in NodeKind::ALL {
            assert_eq!(kind.schema().kind, kind);
            assert_eq!(NodeKind::from_tag(kind.as_str()), Some(kind));
        }
    }
}
