// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed instance store.

use std::path::Path;

use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{InstanceRecord, InstanceStore, WriteOutcome};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const SELECT_COLUMNS: &str = r#"
    SELECT instance_id, workflow_type, status, user_state, current_step, step_input,
           attempt, generation, last_command_id, last_reply, failure,
           step_started_at, workflow_started_at, version, created_at, updated_at
    FROM workflow_instances
"#;

/// SQLite-backed instance store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store from an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/sagaflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect_with(SqlitePoolOptions::new().max_connections(5), &url).await
    }

    /// Connect to a SQLite URL (e.g. `sqlite:data.db?mode=rwc`) and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        Self::connect_with(SqlitePoolOptions::new().max_connections(5), url).await
    }

    /// Private in-memory database, alive as long as the store.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // Every connection to :memory: is a separate database
        let options = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
        Self::connect_with(options, "sqlite::memory:").await
    }

    async fn connect_with(options: SqlitePoolOptions, url: &str) -> Result<Self, CoreError> {
        let pool = options
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: e.to_string(),
            })?;

        Ok(Self { pool })
    }

    /// Get a reference to the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl InstanceStore for SqliteStore {
    async fn load(&self, instance_id: &str) -> Result<Option<InstanceRecord>, CoreError> {
        let record = sqlx::query_as::<_, InstanceRecord>(&format!(
            "{} WHERE instance_id = ?1",
            SELECT_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn store(
        &self,
        record: &InstanceRecord,
        expected_version: i64,
    ) -> Result<WriteOutcome, CoreError> {
        let result = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO workflow_instances (
                    instance_id, workflow_type, status, user_state, current_step, step_input,
                    attempt, generation, last_command_id, last_reply, failure,
                    step_started_at, workflow_started_at, version, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(instance_id) DO NOTHING
                "#,
            )
            .bind(&record.instance_id)
            .bind(&record.workflow_type)
            .bind(&record.status)
            .bind(&record.user_state)
            .bind(&record.current_step)
            .bind(&record.step_input)
            .bind(record.attempt)
            .bind(record.generation)
            .bind(&record.last_command_id)
            .bind(&record.last_reply)
            .bind(&record.failure)
            .bind(record.step_started_at)
            .bind(record.workflow_started_at)
            .bind(record.version)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE workflow_instances
                SET workflow_type = ?2,
                    status = ?3,
                    user_state = ?4,
                    current_step = ?5,
                    step_input = ?6,
                    attempt = ?7,
                    generation = ?8,
                    last_command_id = ?9,
                    last_reply = ?10,
                    failure = ?11,
                    step_started_at = ?12,
                    workflow_started_at = ?13,
                    version = ?14,
                    updated_at = ?15
                WHERE instance_id = ?1
                  AND version = ?16
                "#,
            )
            .bind(&record.instance_id)
            .bind(&record.workflow_type)
            .bind(&record.status)
            .bind(&record.user_state)
            .bind(&record.current_step)
            .bind(&record.step_input)
            .bind(record.attempt)
            .bind(record.generation)
            .bind(&record.last_command_id)
            .bind(&record.last_reply)
            .bind(&record.failure)
            .bind(record.step_started_at)
            .bind(record.workflow_started_at)
            .bind(record.version)
            .bind(record.updated_at)
            .bind(expected_version)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() > 0 {
            Ok(WriteOutcome::Stored)
        } else {
            Ok(WriteOutcome::Conflict)
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE instance_id = ?1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_active(&self, workflow_type: &str) -> Result<Vec<InstanceRecord>, CoreError> {
        let records = sqlx::query_as::<_, InstanceRecord>(&format!(
            r#"{}
            WHERE workflow_type = ?1
              AND status IN ('running', 'waiting_for_async_result', 'paused')
            ORDER BY created_at ASC
            "#,
            SELECT_COLUMNS
        ))
        .bind(workflow_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, status: &str, version: i64) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: id.to_string(),
            workflow_type: "transfer".to_string(),
            status: status.to_string(),
            user_state: Some(br#"{"amount":10}"#.to_vec()),
            current_step: Some("withdraw".to_string()),
            step_input: None,
            attempt: 1,
            generation: 3,
            last_command_id: Some("cmd-1".to_string()),
            last_reply: None,
            failure: None,
            step_started_at: Some(now),
            workflow_started_at: Some(now),
            version,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_insert_and_load() {
        let store = SqliteStore::in_memory().await.unwrap();
        let rec = record("t-1", "waiting_for_async_result", 1);

        assert_eq!(store.store(&rec, 0).await.unwrap(), WriteOutcome::Stored);

        let loaded = store.load("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, "waiting_for_async_result");
        assert_eq!(loaded.user_state, rec.user_state);
        assert_eq!(loaded.generation, 3);
        assert_eq!(loaded.version, 1);
        assert!(loaded.step_started_at.is_some());
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_versioned_writes() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.store(&record("t-1", "running", 1), 0).await.unwrap();

        assert_eq!(
            store.store(&record("t-1", "running", 1), 0).await.unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(
            store.store(&record("t-1", "ended", 2), 1).await.unwrap(),
            WriteOutcome::Stored
        );
        assert_eq!(
            store.store(&record("t-1", "failed", 2), 1).await.unwrap(),
            WriteOutcome::Conflict
        );
        assert_eq!(store.load("t-1").await.unwrap().unwrap().status, "ended");
    }

    #[tokio::test]
    async fn test_list_active_and_delete() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.store(&record("a", "running", 1), 0).await.unwrap();
        store.store(&record("b", "paused", 1), 0).await.unwrap();
        store.store(&record("c", "ended", 1), 0).await.unwrap();

        let active = store.list_active("transfer").await.unwrap();
        assert_eq!(active.len(), 2);
        assert!(store.list_active("refund").await.unwrap().is_empty());

        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.list_active("transfer").await.unwrap().len(), 1);
    }
}
