//! Append-only run history.

use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::models::RunRecord;
use crate::{DbError, KeyValueStore};

const NAMESPACE: &str = "runs";

#[derive(Clone)]
pub struct HistoryStore {
    kv: Arc<dyn KeyValueStore>,
}

impl HistoryStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    /// Append a run. A record is read-only once appended: appending the same
    /// run id twice is a [`DbError::Conflict`].
    pub async fn append(&self, record: &RunRecord) -> Result<(), DbError> {
        let key = record.run_id.to_string();
        let inserted = self
            .kv
            .insert(NAMESPACE, &key, serde_json::to_value(record)?)
            .await?;
        if !inserted {
            return Err(DbError::Conflict(format!("run {key}")));
        }
        debug!(run_id = %key, process_id = %record.process_id, "run appended to history");
        Ok(())
    }

    pub async fn get(&self, run_id: Uuid) -> Result<RunRecord, DbError> {
        let value = self
            .kv
            .get(NAMESPACE, &run_id.to_string())
            .await?
            .ok_or_else(|| DbError::NotFound(format!("run {run_id}")))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Runs of one process (or all runs), newest first.
    pub async fn list(&self, process_id: Option<&str>) -> Result<Vec<RunRecord>, DbError> {
        let mut records = Vec::new();
        for (_, value) in self.kv.list(NAMESPACE).await? {
            let record: RunRecord = serde_json::from_value(value)?;
            if process_id.map_or(true, |p| record.process_id == p) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }

    /// Remove every run of a process. Returns how many were removed.
    pub async fn delete_process(&self, process_id: &str) -> Result<usize, DbError> {
        let mut removed = 0;
        for record in self.list(Some(process_id)).await? {
            if self.kv.delete(NAMESPACE, &record.run_id.to_string()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn record(process_id: &str, minutes_ago: i64) -> RunRecord {
        let started_at = Utc::now() - Duration::minutes(minutes_ago);
        RunRecord {
            run_id: Uuid::new_v4(),
            process_id: process_id.to_string(),
            status: "completed".into(),
            started_at,
            finished_at: Some(started_at),
            document: json!({}),
        }
    }

    fn store() -> HistoryStore {
        HistoryStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn lists_newest_first_per_process() {
        let history = store();
        let old = record("p1", 10);
        let new = record("p1", 1);
        let other = record("p2", 5);
        for r in [&old, &new, &other] {
            history.append(r).await.unwrap();
        }

        let runs = history.list(Some("p1")).await.unwrap();
        assert_eq!(runs, vec![new.clone(), old]);
        assert_eq!(history.list(None).await.unwrap().len(), 3);
        assert_eq!(history.get(new.run_id).await.unwrap(), new);
    }

    #[tokio::test]
    async fn records_are_append_only() {
        let history = store();
        let r = record("p1", 0);
        history.append(&r).await.unwrap();
        assert!(matches!(history.append(&r).await, Err(DbError::Conflict(_))));
    }

    #[tokio::test]
    async fn delete_process_removes_only_its_runs() {
        let history = store();
        history.append(&record("p1", 2)).await.unwrap();
        history.append(&record("p1", 1)).await.unwrap();
        history.append(&record("p2", 1)).await.unwrap();

        assert_eq!(history.delete_process("p1").await.unwrap(), 2);
        assert!(history.list(Some("p1")).await.unwrap().is_empty());
        assert_eq!(history.list(Some("p2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        assert!(matches!(
            store().get(Uuid::new_v4()).await,
            Err(DbError::NotFound(_))
        ));
    }
}
