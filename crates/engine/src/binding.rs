//! Output binding resolver: publishes a finished run's context to the
//! domain registry and files new domain records with the entity sink.
//!
//! Runs after the run record is sealed. Every failure lands in the
//! [`BindingReport`]; nothing here changes the run's status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use db::repository::bindings::BindingConfigStore;
use nodes::domain::{DomainRegistry, DomainTarget, EntityKind, EntityRecord, EntitySink, ObjectiveField};
use nodes::template::render;
use nodes::{ConditionGroup, ContextSnapshot, ValueSource, WriteMode};

use crate::error::BindingError;
use crate::models::{KpiBinding, Process};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Maps a context variable to a domain destination, gated by a guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputBinding {
    /// Context variable to publish; also names the binding in reports.
    pub variable: String,
    /// Overrides where the value comes from (e.g. a literal).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ValueSource>,
    pub destination: DomainTarget,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ConditionGroup>,
    #[serde(default)]
    pub mode: WriteMode,
}

/// One field of a created record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field: String,
    pub source: ValueSource,
}

/// Builds a new risk / incident / defect from the final context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreationConfig {
    pub kind: EntityKind,
    /// `{{key}}` placeholders are filled from the context.
    pub title_template: String,
    #[serde(default)]
    pub description_template: String,
    #[serde(default)]
    pub fields: Vec<FieldMapping>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<ConditionGroup>,
}

/// Everything the resolver applies for one process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    #[serde(default)]
    pub bindings: Vec<OutputBinding>,
    #[serde(default)]
    pub entity_creations: Vec<EntityCreationConfig>,
}

impl BindingConfig {
    /// The bindings declared inline on a process definition.
    pub fn from_process(process: &Process) -> Self {
        Self {
            bindings: process.bindings.clone(),
            entity_creations: process.entity_creations.clone(),
        }
    }

    /// Append another configuration's rules after this one's.
    pub fn extend(&mut self, other: BindingConfig) {
        self.bindings.extend(other.bindings);
        self.entity_creations.extend(other.entity_creations);
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty() && self.entity_creations.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub kind: EntityKind,
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingFailure {
    /// Binding variable or entity title template.
    pub binding: String,
    pub error: BindingError,
}

/// What the resolver did with each rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingReport {
    /// Destinations written, as `variable → destination`.
    pub applied: Vec<String>,
    /// Rules whose guard was false.
    pub skipped: Vec<String>,
    pub created: Vec<CreatedEntity>,
    pub failures: Vec<BindingFailure>,
}

impl BindingReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, binding: &str, error: BindingError) {
        warn!(binding, %error, "output binding failed");
        self.failures.push(BindingFailure {
            binding: binding.to_string(),
            error,
        });
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct OutputBindingResolver {
    registry: Arc<dyn DomainRegistry>,
    sink: Arc<dyn EntitySink>,
}

impl OutputBindingResolver {
    pub fn new(registry: Arc<dyn DomainRegistry>, sink: Arc<dyn EntitySink>) -> Self {
        Self { registry, sink }
    }

    /// Apply bindings, then KPI bindings, then entity creations, in declared
    /// order.
    pub async fn resolve(
        &self,
        process_id: &str,
        config: &BindingConfig,
        kpi_bindings: &[KpiBinding],
        context: &ContextSnapshot,
    ) -> BindingReport {
        let mut report = BindingReport::default();

        for binding in &config.bindings {
            match guard_passes(binding.guard.as_ref(), context) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(variable = %binding.variable, "binding guard false");
                    report.skipped.push(binding.variable.clone());
                    continue;
                }
                Err(error) => {
                    report.fail(&binding.variable, error);
                    continue;
                }
            }
            let value = match &binding.source {
                Some(source) => source.resolve(context),
                None => context.resolve(&binding.variable).cloned(),
            };
            let Some(value) = value else {
                report.fail(&binding.variable, BindingError::MissingValue(binding.variable.clone()));
                continue;
            };
            self.write(&mut report, &binding.variable, &binding.destination, value, binding.mode)
                .await;
        }

        for kpi in kpi_bindings {
            let Some(value) = context.resolve(&kpi.variable).cloned() else {
                report.fail(&kpi.variable, BindingError::MissingValue(kpi.variable.clone()));
                continue;
            };
            let target = DomainTarget::Kpi {
                kpi_id: kpi.kpi_id.clone(),
            };
            self.write(&mut report, &kpi.variable, &target, value, WriteMode::Replace)
                .await;
        }

        for creation in &config.entity_creations {
            let name = creation.title_template.as_str();
            match guard_passes(creation.guard.as_ref(), context) {
                Ok(true) => {}
                Ok(false) => {
                    report.skipped.push(name.to_string());
                    continue;
                }
                Err(error) => {
                    report.fail(name, error);
                    continue;
                }
            }
            let record = build_record(process_id, creation, context);
            let (kind, title) = (record.kind, record.title.clone());
            match self.sink.submit(record).await {
                Ok(id) => {
                    info!(kind = kind.as_str(), %id, %title, "entity created");
                    report.created.push(CreatedEntity { kind, id, title });
                }
                Err(e) => report.fail(name, BindingError::Sink(e.to_string())),
            }
        }

        report
    }

    async fn write(
        &self,
        report: &mut BindingReport,
        name: &str,
        target: &DomainTarget,
        value: Value,
        mode: WriteMode,
    ) {
        match self.registry.write(target, value, mode).await {
            Ok(()) => {
                let applied = format!("{name} → {}", describe(target));
                debug!(%applied, "binding applied");
                report.applied.push(applied);
            }
            Err(e) => report.fail(name, BindingError::Destination(e.to_string())),
        }
    }
}

fn guard_passes(
    guard: Option<&ConditionGroup>,
    context: &ContextSnapshot,
) -> Result<bool, BindingError> {
    match guard {
        None => Ok(true),
        Some(group) => group
            .evaluate(context)
            .map_err(|e| BindingError::Guard(e.to_string())),
    }
}

fn build_record(
    process_id: &str,
    creation: &EntityCreationConfig,
    context: &ContextSnapshot,
) -> EntityRecord {
    let fields: Map<String, Value> = creation
        .fields
        .iter()
        .map(|m| (m.field.clone(), m.source.resolve(context).unwrap_or(Value::Null)))
        .collect();
    EntityRecord {
        kind: creation.kind,
        title: render(&creation.title_template, context),
        description: render(&creation.description_template, context),
        fields,
        source_process: Some(process_id.to_string()),
    }
}

fn describe(target: &DomainTarget) -> String {
    match target {
        DomainTarget::ProcessProperty { process_id, property } => {
            format!("process {process_id}.{property}")
        }
        DomainTarget::RiskAppetiteProperty { appetite_id, property } => {
            format!("risk appetite {appetite_id}.{property}")
        }
        DomainTarget::Objective { objective_id, field } => match field {
            ObjectiveField::Current => format!("objective {objective_id} current"),
            ObjectiveField::Target => format!("objective {objective_id} target"),
        },
        DomainTarget::Kpi { kpi_id } => format!("kpi {kpi_id}"),
        DomainTarget::AssetProperty { asset_id, property, .. } => {
            format!("asset {asset_id}.{property}")
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Typed access to stored per-process binding configurations.
#[derive(Clone)]
pub struct BindingStore {
    store: BindingConfigStore,
}

impl BindingStore {
    pub fn new(store: BindingConfigStore) -> Self {
        Self { store }
    }

    pub async fn save(&self, process_id: &str, config: &BindingConfig) -> Result<(), EngineError> {
        self.store
            .save(process_id, serde_json::to_value(config)?)
            .await?;
        Ok(())
    }

    /// The stored configuration, or an empty one.
    pub async fn load(&self, process_id: &str) -> Result<BindingConfig, EngineError> {
        match self.store.load(process_id).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(BindingConfig::default()),
        }
    }

    pub async fn delete(&self, process_id: &str) -> Result<bool, EngineError> {
        Ok(self.store.delete(process_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::kv::MemoryStore;
    use nodes::domain::InMemoryDomain;
    use serde_json::json;

    fn context() -> ContextSnapshot {
        nodes::ExecutionContext::with_inputs([
            ("score".to_string(), json!(72)),
            ("asset".to_string(), json!({ "name": "Pump 7" })),
        ])
        .snapshot()
    }

    fn resolver(domain: &Arc<InMemoryDomain>) -> OutputBindingResolver {
        OutputBindingResolver::new(domain.clone(), domain.clone())
    }

    fn config(value: Value) -> BindingConfig {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn guarded_binding_writes_only_when_guard_holds() {
        let domain = Arc::new(InMemoryDomain::new());
        let cfg = config(json!({
            "bindings": [
                {
                    "variable": "score",
                    "destination": { "kind": "objective", "objective_id": "o1" },
                    "guard": { "conditions": [ { "field": "score", "operator": "greater_than", "value": 50 } ] }
                },
                {
                    "variable": "score",
                    "destination": { "kind": "kpi", "kpi_id": "k-low" },
                    "guard": { "conditions": [ { "field": "score", "operator": "less_than", "value": 50 } ] }
                }
            ]
        }));

        let report = resolver(&domain).resolve("p1", &cfg, &[], &context()).await;

        assert!(report.is_clean());
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.skipped, vec!["score"]);
        assert_eq!(
            domain.value_at(&DomainTarget::Objective {
                objective_id: "o1".into(),
                field: ObjectiveField::Current
            }),
            Some(json!(72))
        );
        assert_eq!(domain.value_at(&DomainTarget::Kpi { kpi_id: "k-low".into() }), None);
    }

    #[tokio::test]
    async fn literal_source_and_append_mode() {
        let domain = Arc::new(InMemoryDomain::new());
        let cfg = config(json!({
            "bindings": [ {
                "variable": "note",
                "source": { "from": "literal", "value": "reviewed" },
                "destination": { "kind": "process_property", "process_id": "p1", "property": "log" },
                "mode": "append"
            } ]
        }));
        let resolver = resolver(&domain);
        resolver.resolve("p1", &cfg, &[], &context()).await;
        resolver.resolve("p1", &cfg, &[], &context()).await;

        let target = DomainTarget::ProcessProperty {
            process_id: "p1".into(),
            property: "log".into(),
        };
        assert_eq!(domain.value_at(&target), Some(json!(["reviewed", "reviewed"])));
    }

    #[tokio::test]
    async fn kpi_bindings_publish_their_variable() {
        let domain = Arc::new(InMemoryDomain::new());
        let kpis = [KpiBinding {
            kpi_id: "k1".into(),
            variable: "score".into(),
        }];
        let report = resolver(&domain)
            .resolve("p1", &BindingConfig::default(), &kpis, &context())
            .await;
        assert!(report.is_clean());
        assert_eq!(domain.value_at(&DomainTarget::Kpi { kpi_id: "k1".into() }), Some(json!(72)));
    }

    #[tokio::test]
    async fn missing_variable_and_bad_destination_are_reported() {
        let domain = Arc::new(InMemoryDomain::new());
        let cfg = config(json!({
            "bindings": [
                { "variable": "absent", "destination": { "kind": "kpi", "kpi_id": "k" } },
                {
                    "variable": "score",
                    "destination": { "kind": "asset_property", "asset_id": "nope", "property": "score" }
                }
            ]
        }));
        let report = resolver(&domain).resolve("p1", &cfg, &[], &context()).await;
        assert_eq!(report.failures.len(), 2);
        assert!(matches!(report.failures[0].error, BindingError::MissingValue(_)));
        assert!(matches!(report.failures[1].error, BindingError::Destination(_)));
    }

    #[tokio::test]
    async fn entity_creation_renders_templates_and_fields() {
        let domain = Arc::new(InMemoryDomain::new());
        let cfg = config(json!({
            "entity_creations": [ {
                "kind": "risk",
                "title_template": "High score on {{asset.name}}",
                "description_template": "Score reached {{score}}",
                "fields": [ { "field": "severity", "source": { "from": "literal", "value": "high" } } ],
                "guard": { "conditions": [ { "field": "score", "operator": "greater_or_equal", "value": 70 } ] }
            } ]
        }));

        let report = resolver(&domain).resolve("p1", &cfg, &[], &context()).await;

        assert_eq!(report.created.len(), 1);
        let (_, record) = &domain.created()[0];
        assert_eq!(record.title, "High score on Pump 7");
        assert_eq!(record.description, "Score reached 72");
        assert_eq!(record.fields["severity"], "high");
        assert_eq!(record.source_process.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn sink_rejection_is_not_fatal() {
        let domain = Arc::new(InMemoryDomain::new());
        domain.reject_submissions("read-only");
        let cfg = config(json!({
            "bindings": [ { "variable": "score", "destination": { "kind": "kpi", "kpi_id": "k" } } ],
            "entity_creations": [ { "kind": "incident", "title_template": "x" } ]
        }));
        let report = resolver(&domain).resolve("p1", &cfg, &[], &context()).await;
        assert_eq!(report.applied.len(), 1);
        assert!(matches!(report.failures[0].error, BindingError::Sink(_)));
    }

    #[tokio::test]
    async fn binding_store_round_trips_config() {
        let store = BindingStore::new(BindingConfigStore::new(Arc::new(MemoryStore::new())));
        assert!(store.load("p1").await.unwrap().is_empty());

        let cfg = config(json!({
            "bindings": [ { "variable": "score", "destination": { "kind": "kpi", "kpi_id": "k" } } ]
        }));
        store.save("p1", &cfg).await.unwrap();
        assert_eq!(store.load("p1").await.unwrap(), cfg);
        assert!(store.delete("p1").await.unwrap());
    }
}
