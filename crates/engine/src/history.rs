//! Typed run history over the db crate's append-only store.

use std::sync::Arc;

use uuid::Uuid;

use db::models::RunRecord;
use db::repository::history::HistoryStore;
use db::KeyValueStore;

use crate::models::ExecutionRun;
use crate::EngineError;

#[derive(Clone)]
pub struct RunHistory {
    store: HistoryStore,
}

impl RunHistory {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store: HistoryStore::new(kv),
        }
    }

    pub async fn record(&self, run: &ExecutionRun) -> Result<(), EngineError> {
        let record = RunRecord {
            run_id: run.run_id,
            process_id: run.process_id.clone(),
            status: run.status.to_string(),
            started_at: run.started_at,
            finished_at: Some(run.finished_at),
            document: serde_json::to_value(run)?,
        };
        self.store.append(&record).await?;
        Ok(())
    }

    pub async fn get(&self, run_id: Uuid) -> Result<ExecutionRun, EngineError> {
        let record = self.store.get(run_id).await?;
        Ok(serde_json::from_value(record.document)?)
    }

    /// Runs newest first, optionally for one process.
    pub async fn list(&self, process_id: Option<&str>) -> Result<Vec<ExecutionRun>, EngineError> {
        self.store
            .list(process_id)
            .await?
            .into_iter()
            .map(|r| serde_json::from_value(r.document).map_err(EngineError::from))
            .collect()
    }

    pub async fn delete_process(&self, process_id: &str) -> Result<usize, EngineError> {
        Ok(self.store.delete_process(process_id).await?)
    }
}
