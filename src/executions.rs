//! SQLite-backed execution store.
//!
//! One row per execution in the `executions` table. Saves are
//! compare-and-swap on the `version` column and never touch a row in a
//! terminal state. Leases (`lease_owner`, `lease_expires_at`) keep two
//! workers from driving the same execution at once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use level0_core::error::{ErrorKind, StoreError};
use level0_core::machine::{Execution, ExecutionState, StepFailure};
use level0_core::models::{ExecutionId, FileDescriptor};
use level0_core::ports::{ExecutionStore, StartOutcome};

use crate::db::{now_millis, store_error};

const SELECT_EXECUTION: &str = r#"
    SELECT id, descriptor_json, state, import_attempts, notify_attempts,
           last_error_kind, last_error_message, last_error_retryable,
           retry_at, summary_json, created_at, updated_at, version
    FROM executions
"#;

#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: SqlitePool,
}

impl SqliteExecutionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of executions per state, for status output.
    pub async fn count_by_state(&self) -> Result<Vec<(ExecutionState, i64)>, StoreError> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM executions GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(store_error)?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.get("state");
            let state = state.parse::<ExecutionState>().map_err(StoreError::Corrupt)?;
            counts.push((state, row.get::<i64, _>("n")));
        }
        counts.sort_by_key(|(s, _)| s.as_label());
        Ok(counts)
    }
}

fn millis_to_time(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn row_to_execution(row: &SqliteRow) -> Result<Execution, StoreError> {
    let id: String = row.get("id");
    let id = ExecutionId::parse(&id).map_err(StoreError::Corrupt)?;

    let descriptor_json: String = row.get("descriptor_json");
    let descriptor: FileDescriptor = serde_json::from_str(&descriptor_json)
        .map_err(|e| StoreError::Corrupt(format!("descriptor of {}: {}", id, e)))?;

    let state: String = row.get("state");
    let state = state.parse::<ExecutionState>().map_err(StoreError::Corrupt)?;

    let last_error = match row.get::<Option<String>, _>("last_error_kind") {
        Some(kind) => Some(StepFailure {
            kind: kind.parse::<ErrorKind>().map_err(StoreError::Corrupt)?,
            message: row
                .get::<Option<String>, _>("last_error_message")
                .unwrap_or_default(),
            retryable: row
                .get::<Option<i64>, _>("last_error_retryable")
                .unwrap_or(0)
                != 0,
        }),
        None => None,
    };

    let summary = match row.get::<Option<String>, _>("summary_json") {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| StoreError::Corrupt(format!("summary of {}: {}", id, e)))?,
        ),
        None => None,
    };

    Ok(Execution {
        id,
        descriptor,
        state,
        import_attempts: row.get::<i64, _>("import_attempts") as u32,
        notify_attempts: row.get::<i64, _>("notify_attempts") as u32,
        last_error,
        retry_at: row.get::<Option<i64>, _>("retry_at").map(millis_to_time),
        summary,
        created_at: millis_to_time(row.get("created_at")),
        updated_at: millis_to_time(row.get("updated_at")),
        version: row.get("version"),
    })
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn start(
        &self,
        id: &ExecutionId,
        descriptor: &FileDescriptor,
    ) -> Result<StartOutcome, StoreError> {
        let descriptor_json = serde_json::to_string(descriptor)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let now = now_millis();
        let result = sqlx::query(
            r#"
            INSERT INTO executions (id, object_key, object_version, file_type, descriptor_json,
                                    state, created_at, updated_at, version)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(&descriptor.object_key)
        .bind(&descriptor.object_version)
        .bind(descriptor.file_type.to_string())
        .bind(&descriptor_json)
        .bind(ExecutionState::Pending.as_label())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        let execution = self
            .load(id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("execution {} vanished after start", id)))?;
        Ok(StartOutcome {
            execution,
            created: result.rows_affected() == 1,
        })
    }

    async fn load(&self, id: &ExecutionId) -> Result<Option<Execution>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_EXECUTION))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;
        row.as_ref().map(row_to_execution).transpose()
    }

    async fn save(
        &self,
        expected_version: i64,
        execution: &Execution,
    ) -> Result<bool, StoreError> {
        let summary_json = execution
            .summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let error = execution.last_error.as_ref();

        let result = sqlx::query(
            r#"
            UPDATE executions SET
                state = ?,
                import_attempts = ?,
                notify_attempts = ?,
                last_error_kind = ?,
                last_error_message = ?,
                last_error_retryable = ?,
                retry_at = ?,
                summary_json = ?,
                updated_at = ?,
                version = version + 1
            WHERE id = ? AND version = ? AND state NOT IN ('succeeded', 'failed')
            "#,
        )
        .bind(execution.state.as_label())
        .bind(execution.import_attempts as i64)
        .bind(execution.notify_attempts as i64)
        .bind(error.map(|e| e.kind.as_str()))
        .bind(error.map(|e| e.message.as_str()))
        .bind(error.map(|e| e.retryable as i64))
        .bind(execution.retry_at.map(|t| t.timestamp_millis()))
        .bind(summary_json)
        .bind(execution.updated_at.timestamp_millis())
        .bind(execution.id.as_str())
        .bind(expected_version)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim(
        &self,
        id: &ExecutionId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE executions SET lease_owner = ?, lease_expires_at = ?
            WHERE id = ?
              AND (lease_owner IS NULL OR lease_owner = ? OR lease_expires_at <= ?)
            "#,
        )
        .bind(owner)
        .bind(now + ttl.as_millis() as i64)
        .bind(id.as_str())
        .bind(owner)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, id: &ExecutionId, owner: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE executions SET lease_owner = NULL, lease_expires_at = NULL WHERE id = ? AND lease_owner = ?",
        )
        .bind(id.as_str())
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;
        Ok(())
    }

    async fn list(
        &self,
        state: Option<ExecutionState>,
        limit: usize,
    ) -> Result<Vec<Execution>, StoreError> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "{} WHERE state = ? ORDER BY updated_at DESC, id LIMIT ?",
                    SELECT_EXECUTION
                ))
                .bind(state.as_label())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "{} ORDER BY updated_at DESC, id LIMIT ?",
                    SELECT_EXECUTION
                ))
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(store_error)?;
        rows.iter().map(row_to_execution).collect()
    }

    async fn resumable(&self, limit: usize) -> Result<Vec<ExecutionId>, StoreError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM executions
            WHERE state NOT IN ('succeeded', 'failed')
              AND (retry_at IS NULL OR retry_at <= ?1)
              AND (lease_owner IS NULL OR lease_expires_at <= ?1)
            ORDER BY updated_at, id
            LIMIT ?2
            "#,
        )
        .bind(now_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        ids.iter()
            .map(|id| ExecutionId::parse(id).map_err(StoreError::Corrupt))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::temp_pool;
    use level0_core::models::{FileType, ImportSummary};

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new("L0/2024-01-01/0ce86a42.ac1", "v1", Utc::now())
    }

    #[tokio::test]
    async fn test_start_is_create_if_absent() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        let d = descriptor();
        let id = d.execution_id();

        let first = store.start(&id, &d).await.unwrap();
        assert!(first.created);
        assert_eq!(first.execution.state, ExecutionState::Pending);
        assert_eq!(first.execution.descriptor, d);

        let second = store.start(&id, &d).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.execution.id, id);
    }

    #[tokio::test]
    async fn test_save_round_trips_and_guards_version() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        let d = descriptor();
        let id = d.execution_id();
        let mut e = store.start(&id, &d).await.unwrap().execution;

        e.state = ExecutionState::Notifying;
        e.import_attempts = 2;
        e.last_error = Some(StepFailure::new(ErrorKind::StoreUnavailable, "db down"));
        e.retry_at = Some(Utc::now());
        e.summary = Some(ImportSummary {
            object_key: d.object_key.clone(),
            object_version: d.object_version.clone(),
            file_type: FileType::Ac1,
            category: FileType::Ac1.category(),
            row_count: 128,
            instrument: "AC1".into(),
            range: None,
            newly_committed: true,
        });
        assert!(store.save(0, &e).await.unwrap());
        assert!(!store.save(0, &e).await.unwrap());

        let loaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state, ExecutionState::Notifying);
        assert_eq!(loaded.import_attempts, 2);
        assert_eq!(loaded.last_error, e.last_error);
        assert_eq!(loaded.summary, e.summary);
    }

    #[tokio::test]
    async fn test_terminal_rows_are_immutable() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        let d = descriptor();
        let id = d.execution_id();
        let mut e = store.start(&id, &d).await.unwrap().execution;

        e.state = ExecutionState::Succeeded;
        assert!(store.save(0, &e).await.unwrap());
        e.state = ExecutionState::Importing;
        assert!(!store.save(1, &e).await.unwrap());
        assert_eq!(
            store.load(&id).await.unwrap().unwrap().state,
            ExecutionState::Succeeded
        );
        assert!(store.resumable(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leases_and_resumable() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        let d = descriptor();
        let id = d.execution_id();
        store.start(&id, &d).await.unwrap();

        assert_eq!(store.resumable(10).await.unwrap(), vec![id.clone()]);
        assert!(store.claim(&id, "a", Duration::from_secs(60)).await.unwrap());
        assert!(store.claim(&id, "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.claim(&id, "b", Duration::from_secs(60)).await.unwrap());
        assert!(store.resumable(10).await.unwrap().is_empty());

        store.release(&id, "b").await.unwrap();
        assert!(!store.claim(&id, "b", Duration::from_secs(60)).await.unwrap());
        store.release(&id, "a").await.unwrap();
        assert!(store.claim(&id, "b", Duration::ZERO).await.unwrap());
        assert_eq!(store.resumable(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_retry_is_not_resumable_until_due() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        let d = descriptor();
        let id = d.execution_id();
        let mut e = store.start(&id, &d).await.unwrap().execution;

        e.state = ExecutionState::Importing;
        e.retry_at = Some(Utc::now() + chrono::Duration::hours(1));
        assert!(store.save(0, &e).await.unwrap());
        assert!(store.resumable(10).await.unwrap().is_empty());

        e.retry_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(store.save(1, &e).await.unwrap());
        assert_eq!(store.resumable(10).await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let (_dir, pool) = temp_pool().await;
        let store = SqliteExecutionStore::new(pool);
        for key in ["L0/a/00000001.fba", "L0/a/00000002.fba"] {
            let d = FileDescriptor::new(key, "null", Utc::now());
            store.start(&d.execution_id(), &d).await.unwrap();
        }
        assert_eq!(store.list(None, 10).await.unwrap().len(), 2);
        assert_eq!(
            store.list(Some(ExecutionState::Pending), 10).await.unwrap().len(),
            2
        );
        assert!(store
            .list(Some(ExecutionState::Failed), 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);

        let counts = store.count_by_state().await.unwrap();
        assert_eq!(counts, vec![(ExecutionState::Pending, 2)]);
    }
}
