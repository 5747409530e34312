//! Namespaced key-value storage for JSON documents.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use tokio::sync::RwLock;

use crate::models::KvRow;
use crate::{DbError, DbPool};

/// Storage seam for history and configuration documents.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, DbError>;

    /// Insert or overwrite.
    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), DbError>;

    /// Insert only if the key is free. Returns `false` when it was taken.
    async fn insert(&self, namespace: &str, key: &str, value: Value) -> Result<bool, DbError>;

    /// Returns whether the key existed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, DbError>;

    /// Every entry of a namespace, ordered by key.
    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, DbError>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Process-local store, used by tests and the CLI's default backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<(String, String), Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, DbError> {
        let entries = self.entries.read().await;
        Ok(entries.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), DbError> {
        self.entries
            .write()
            .await
            .insert((namespace.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn insert(&self, namespace: &str, key: &str, value: Value) -> Result<bool, DbError> {
        let mut entries = self.entries.write().await;
        let slot = (namespace.to_string(), key.to_string());
        if entries.contains_key(&slot) {
            return Ok(false);
        }
        entries.insert(slot, value);
        Ok(true)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, DbError> {
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(&(namespace.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, DbError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|((_, key), value)| (key.clone(), value.clone()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

/// Store backed by the `kv_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// The pool must already be migrated.
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, DbError> {
        let row = sqlx::query_as::<_, KvRow>(
            r#"
            SELECT namespace, key, value, updated_at
            FROM kv_entries
            WHERE namespace = ? AND key = ?
            "#,
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.value.0))
    }

    async fn put(&self, namespace: &str, key: &str, value: Value) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (namespace, key)
            DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(Json(value))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert(&self, namespace: &str, key: &str, value: Value) -> Result<bool, DbError> {
        let result = sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (namespace, key) DO NOTHING
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(Json(value))
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, DbError> {
        let result = sqlx::query(r#"DELETE FROM kv_entries WHERE namespace = ? AND key = ?"#)
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, namespace: &str) -> Result<Vec<(String, Value)>, DbError> {
        let rows = sqlx::query_as::<_, KvRow>(
            r#"
            SELECT namespace, key, value, updated_at
            FROM kv_entries
            WHERE namespace = ?
            ORDER BY key
            "#,
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| (r.key, r.value.0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{create_pool, run_migrations};
    use serde_json::json;

    async fn exercise(store: &dyn KeyValueStore) {
        assert_eq!(store.get("ns", "a").await.unwrap(), None);

        store.put("ns", "b", json!(2)).await.unwrap();
        store.put("ns", "a", json!({ "x": 1 })).await.unwrap();
        store.put("other", "a", json!("elsewhere")).await.unwrap();
        store.put("ns", "b", json!(3)).await.unwrap();

        assert_eq!(store.get("ns", "a").await.unwrap(), Some(json!({ "x": 1 })));
        let listed = store.list("ns").await.unwrap();
        assert_eq!(listed, vec![("a".to_string(), json!({ "x": 1 })), ("b".to_string(), json!(3))]);

        assert!(!store.insert("ns", "a", json!(0)).await.unwrap());
        assert!(store.insert("ns", "c", json!(0)).await.unwrap());

        assert!(store.delete("ns", "a").await.unwrap());
        assert!(!store.delete("ns", "a").await.unwrap());
        assert_eq!(store.get("other", "a").await.unwrap(), Some(json!("elsewhere")));
    }

    #[tokio::test]
    async fn memory_store_contract() {
        exercise(&MemoryStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_contract() {
        let pool = create_pool("sqlite::memory:", 4).await.unwrap();
        run_migrations(&pool).await.unwrap();
        exercise(&SqliteStore::new(pool)).await;
    }
}
