//! Seams to the business domain: the asset/KPI/objective registry the engine
//! reads from and writes to, and the sink that accepts new risk, incident
//! and defect records.
//!
//! [`InMemoryDomain`] implements both and backs tests and the CLI.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::context::WriteMode;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum DomainError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot append to {0}: current value is not an array")]
    AppendToNonArray(String),

    #[error("entity sink rejected record: {0}")]
    Rejected(String),
}

/// Kinds of record the entity sink can create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Risk,
    Incident,
    Defect,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Risk => "risk",
            Self::Incident => "incident",
            Self::Defect => "defect",
        }
    }
}

/// Record collections a source node can load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordCollection {
    Assets,
    Risks,
    Incidents,
    Defects,
    Kpis,
    Objectives,
}

/// A domain asset as exposed to entity-binder nodes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub name: String,
    /// Standard properties beyond id/name (`kind`, `owner`, `status`, ...).
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub custom_properties: Map<String, Value>,
    #[serde(default)]
    pub risk_ids: Vec<String>,
    #[serde(default)]
    pub incident_ids: Vec<String>,
    #[serde(default)]
    pub defect_ids: Vec<String>,
}

impl Asset {
    /// Standard property lookup, including `id` and `name`.
    pub fn base_property(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "name" => Some(Value::String(self.name.clone())),
            other => self.properties.get(other).cloned(),
        }
    }
}

/// Which objective value a binding targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectiveField {
    #[default]
    Current,
    Target,
}

/// A writable location in the domain registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainTarget {
    ProcessProperty {
        process_id: String,
        property: String,
    },
    RiskAppetiteProperty {
        appetite_id: String,
        property: String,
    },
    Objective {
        objective_id: String,
        #[serde(default)]
        field: ObjectiveField,
    },
    Kpi {
        kpi_id: String,
    },
    AssetProperty {
        asset_id: String,
        property: String,
        #[serde(default)]
        custom: bool,
    },
}

impl DomainTarget {
    fn slot_key(&self) -> String {
        match self {
            Self::ProcessProperty {
                process_id,
                property,
            } => format!("process/{process_id}/{property}"),
            Self::RiskAppetiteProperty {
                appetite_id,
                property,
            } => format!("risk_appetite/{appetite_id}/{property}"),
            Self::Objective {
                objective_id,
                field,
            } => format!(
                "objective/{objective_id}/{}",
                match field {
                    ObjectiveField::Current => "current",
                    ObjectiveField::Target => "target",
                }
            ),
            Self::Kpi { kpi_id } => format!("kpi/{kpi_id}/current"),
            Self::AssetProperty {
                asset_id,
                property,
                custom,
            } => format!(
                "asset/{asset_id}/{}{property}",
                if *custom { "custom/" } else { "" }
            ),
        }
    }
}

/// A fully built domain record submitted to the entity sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Process that produced the record.
    #[serde(default)]
    pub source_process: Option<String>,
}

/// Read/write access to assets, KPIs, objectives and process properties.
#[async_trait]
pub trait DomainRegistry: Send + Sync {
    async fn asset(&self, asset_id: &str) -> Result<Asset, DomainError>;

    async fn records(&self, collection: RecordCollection) -> Result<Vec<Value>, DomainError>;

    async fn read(&self, target: &DomainTarget) -> Result<Option<Value>, DomainError>;

    /// Write `value`; `Append` requires the current value to be an array
    /// (or absent).
    async fn write(
        &self,
        target: &DomainTarget,
        value: Value,
        mode: WriteMode,
    ) -> Result<(), DomainError>;
}

/// Accepts entity-creation requests. Returns the new record id.
#[async_trait]
pub trait EntitySink: Send + Sync {
    async fn submit(&self, record: EntityRecord) -> Result<String, DomainError>;
}

/// Seed data for [`InMemoryDomain`], loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainFixture {
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub records: HashMap<RecordCollection, Vec<Value>>,
}

#[derive(Debug, Default)]
struct DomainState {
    assets: BTreeMap<String, Asset>,
    records: HashMap<RecordCollection, Vec<Value>>,
    slots: BTreeMap<String, Value>,
    created: Vec<(String, EntityRecord)>,
    reject_sink: Option<String>,
}

/// Process-local domain registry and entity sink.
#[derive(Debug, Default)]
pub struct InMemoryDomain {
    state: Mutex<DomainState>,
}

impl InMemoryDomain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: DomainFixture) -> Self {
        let domain = Self::new();
        {
            let mut state = domain.lock();
            for asset in fixture.assets {
                state.assets.insert(asset.id.clone(), asset);
            }
            state.records = fixture.records;
        }
        domain
    }

    pub fn with_asset(self, asset: Asset) -> Self {
        self.lock().assets.insert(asset.id.clone(), asset);
        self
    }

    /// Make every subsequent sink submission fail with `reason`.
    pub fn reject_submissions(&self, reason: impl Into<String>) {
        self.lock().reject_sink = Some(reason.into());
    }

    /// Current value at a target, for assertions and inspection.
    pub fn value_at(&self, target: &DomainTarget) -> Option<Value> {
        self.lock().slots.get(&target.slot_key()).cloned()
    }

    /// Every record accepted by the sink, with its assigned id.
    pub fn created(&self) -> Vec<(String, EntityRecord)> {
        self.lock().created.clone()
    }

    /// All written slots keyed by their path (`kpi/<id>/current`, ...).
    pub fn slots(&self) -> BTreeMap<String, Value> {
        self.lock().slots.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DomainState> {
        // A poisoned lock only means a test thread panicked mid-write.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl DomainRegistry for InMemoryDomain {
    async fn asset(&self, asset_id: &str) -> Result<Asset, DomainError> {
        self.lock()
            .assets
            .get(asset_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("asset '{asset_id}'")))
    }

    async fn records(&self, collection: RecordCollection) -> Result<Vec<Value>, DomainError> {
        let state = self.lock();
        if collection == RecordCollection::Assets {
            return Ok(state
                .assets
                .values()
                .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
                .collect());
        }
        Ok(state.records.get(&collection).cloned().unwrap_or_default())
    }

    async fn read(&self, target: &DomainTarget) -> Result<Option<Value>, DomainError> {
        Ok(self.value_at(target))
    }

    async fn write(
        &self,
        target: &DomainTarget,
        value: Value,
        mode: WriteMode,
    ) -> Result<(), DomainError> {
        let mut state = self.lock();
        if let DomainTarget::AssetProperty { asset_id, .. } = target {
            if !state.assets.contains_key(asset_id) {
                return Err(DomainError::NotFound(format!("asset '{asset_id}'")));
            }
        }
        let key = target.slot_key();
        match mode {
            WriteMode::Replace => {
                state.slots.insert(key, value);
            }
            WriteMode::Append => {
                let slot = state
                    .slots
                    .entry(key.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(items) = slot else {
                    return Err(DomainError::AppendToNonArray(key));
                };
                match value {
                    Value::Array(more) => items.extend(more),
                    other => items.push(other),
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntitySink for InMemoryDomain {
    async fn submit(&self, record: EntityRecord) -> Result<String, DomainError> {
        let mut state = self.lock();
        if let Some(reason) = &state.reject_sink {
            return Err(DomainError::Rejected(reason.clone()));
        }
        let id = format!("{}-{}", record.kind.as_str(), state.created.len() + 1);
        let collection = match record.kind {
            EntityKind::Risk => RecordCollection::Risks,
            EntityKind::Incident => RecordCollection::Incidents,
            EntityKind::Defect => RecordCollection::Defects,
        };
        let mut stored = record.fields.clone();
        stored.insert("id".into(), Value::String(id.clone()));
        stored.insert("title".into(), Value::String(record.title.clone()));
        stored.insert("description".into(), Value::String(record.description.clone()));
        state
            .records
            .entry(collection)
            .or_default()
            .push(Value::Object(stored));
        state.created.push((id.clone(), record));
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn append_requires_array_slot() {
        let domain = InMemoryDomain::new();
        let kpi = DomainTarget::Kpi { kpi_id: "k".into() };
        domain.write(&kpi, json!(5), WriteMode::Replace).await.unwrap();
        let err = domain.write(&kpi, json!(6), WriteMode::Append).await.unwrap_err();
        assert!(matches!(err, DomainError::AppendToNonArray(_)));
    }

    #[tokio::test]
    async fn asset_property_write_needs_existing_asset() {
        let domain = InMemoryDomain::new();
        let target = DomainTarget::AssetProperty {
            asset_id: "ghost".into(),
            property: "status".into(),
            custom: false,
        };
        assert!(domain.write(&target, json!("ok"), WriteMode::Replace).await.is_err());
    }

    #[tokio::test]
    async fn sink_assigns_ids_and_stores_records() {
        let domain = InMemoryDomain::new();
        let id = domain
            .submit(EntityRecord {
                kind: EntityKind::Incident,
                title: "Outage".into(),
                description: String::new(),
                fields: Map::new(),
                source_process: None,
            })
            .await
            .unwrap();
        assert_eq!(id, "incident-1");
        let incidents = domain.records(RecordCollection::Incidents).await.unwrap();
        assert_eq!(incidents[0]["title"], "Outage");
    }

    #[test]
    fn targets_deserialize_from_tagged_json() {
        let t: DomainTarget = serde_json::from_value(json!({
            "kind": "objective", "objective_id": "o1", "field": "target"
        }))
        .unwrap();
        assert_eq!(
            t,
            DomainTarget::Objective {
                objective_id: "o1".into(),
                field: ObjectiveField::Target
            }
        );
    }
}
