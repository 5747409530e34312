//! Persistence models. These carry no domain behaviour; domain types live
//! in the `engine` crate and are stored here as JSON documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// kv_entries
// ---------------------------------------------------------------------------

/// A row of the `kv_entries` table.
#[derive(Debug, Clone, FromRow)]
pub struct KvRow {
    pub namespace: String,
    pub key: String,
    pub value: Json<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// run history
// ---------------------------------------------------------------------------

/// One appended run. `document` is the full serialized run; the other
/// fields are lifted out for listing and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub process_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub document: serde_json::Value,
}
