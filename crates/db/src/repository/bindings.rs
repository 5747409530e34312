//! Per-process output-binding configuration documents.

use std::sync::Arc;

use serde_json::Value;

use crate::{DbError, KeyValueStore};

const NAMESPACE: &str = "binding_configs";

#[derive(Clone)]
pub struct BindingConfigStore {
    kv: Arc<dyn KeyValueStore>,
}

impl BindingConfigStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Replace the configuration stored for `process_id`.
    pub async fn save(&self, process_id: &str, config: Value) -> Result<(), DbError> {
        self.kv.put(NAMESPACE, process_id, config).await
    }

    pub async fn load(&self, process_id: &str) -> Result<Option<Value>, DbError> {
        self.kv.get(NAMESPACE, process_id).await
    }

    pub async fn delete(&self, process_id: &str) -> Result<bool, DbError> {
        self.kv.delete(NAMESPACE, process_id).await
    }
}
