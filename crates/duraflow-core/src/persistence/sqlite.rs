// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::types::Json;

use crate::error::Error;
use crate::migrations::SQLITE as MIGRATOR;

use super::{
    CallRecord, CallStatus, ExecutionGuard, ExecutionRecord, ExecutionStatus, NewCall,
    NewExecution, Persistence,
};

const EXECUTION_COLUMNS: &str = "id, code, external_functions, inputs, state, status, \
     current_resume_group_id, output, error, created_at, updated_at";

const CALL_COLUMNS: &str = "c.id, c.execution_id, c.resume_group_id, c.call_id, c.function_name, \
     c.args, c.kwargs, c.status, c.job_id, c.result, c.error, c.created_at, c.completed_at";

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The pool must already be migrated, see [`crate::migrations::run`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// This convenience constructor handles all setup:
    /// - Creates parent directories if they don't exist
    /// - Creates the database file if it doesn't exist
    /// - Connects to the database with sensible defaults
    /// - Runs all migrations
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/duraflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| Error::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        Self::migrated(pool).await
    }

    /// Create a private in-memory database, mostly useful for tests and demos.
    ///
    /// The pool holds a single connection that never expires, since the database
    /// lives only as long as that connection.
    pub async fn in_memory() -> Result<Self, Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Database {
                operation: "connect".to_string(),
                details: format!("Failed to open in-memory SQLite: {}", e),
            })?;

        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, Error> {
        MIGRATOR.run(&pool).await.map_err(|e| Error::Database {
            operation: "migrate".to_string(),
            details: format!("Failed to run migrations: {}", e),
        })?;
        Ok(Self { pool })
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_execution(&self, execution: &NewExecution) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO executions (id, code, external_functions, inputs, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'scheduled', CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.code)
        .bind(Json(&execution.external_functions))
        .bind(Json(&execution.inputs))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, Error> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?");
        let record = sqlx::query_as::<_, ExecutionRecord>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, Error> {
        let sql = format!(
            r#"
            SELECT {EXECUTION_COLUMNS} FROM executions
            WHERE (? IS NULL OR status = ?)
            ORDER BY created_at ASC, rowid ASC
            LIMIT ? OFFSET ?
            "#
        );
        let status = status.map(|s| s.as_str());
        let records = sqlx::query_as::<_, ExecutionRecord>(&sql)
            .bind(status)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }

    async fn list_active_execution_ids(&self) -> Result<Vec<String>, Error> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM executions
            WHERE status IN ('scheduled', 'waiting')
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn suspend_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        snapshot: &[u8],
        resume_group_id: &str,
        calls: &[NewCall],
    ) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE executions
            SET state = ?, status = 'waiting', current_resume_group_id = ?,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND current_resume_group_id IS ?
            "#,
        )
        .bind(snapshot)
        .bind(resume_group_id)
        .bind(execution_id)
        .bind(guard.status())
        .bind(guard.resume_group_id())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for call in calls {
            sqlx::query(
                r#"
                INSERT INTO calls (execution_id, resume_group_id, call_id, function_name,
                                   args, kwargs, status, created_at)
                VALUES (?, ?, ?, ?, ?, ?, 'pending', CURRENT_TIMESTAMP)
                "#,
            )
            .bind(execution_id)
            .bind(resume_group_id)
            .bind(call.call_id)
            .bind(&call.function_name)
            .bind(Json(&call.args))
            .bind(Json(&call.kwargs))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn complete_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        output: &Value,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'completed', output = ?, state = NULL, error = NULL,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND current_resume_group_id IS ?
            "#,
        )
        .bind(Json(output))
        .bind(execution_id)
        .bind(guard.status())
        .bind(guard.resume_group_id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        error: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE executions
            SET status = 'failed', error = ?, updated_at = CURRENT_TIMESTAMP
            WHERE id = ? AND status = ? AND current_resume_group_id IS ?
            "#,
        )
        .bind(error)
        .bind(execution_id)
        .bind(guard.status())
        .bind(guard.resume_group_id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_execution(&self, execution_id: &str) -> Result<bool, Error> {
        let mut tx = self.pool.begin().await?;

        // Explicit delete keeps the cascade independent of the foreign_keys pragma
        sqlx::query("DELETE FROM calls WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM executions WHERE id = ?")
            .bind(execution_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_group_calls(&self, resume_group_id: &str) -> Result<Vec<CallRecord>, Error> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls c WHERE c.resume_group_id = ? ORDER BY c.call_id"
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(resume_group_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(calls)
    }

    async fn list_group_calls_with_status(
        &self,
        resume_group_id: &str,
        status: CallStatus,
    ) -> Result<Vec<CallRecord>, Error> {
        let sql = format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls c
            WHERE c.resume_group_id = ? AND c.status = ?
            ORDER BY c.call_id
            "#
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(resume_group_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        Ok(calls)
    }

    async fn list_execution_calls_with_status(
        &self,
        execution_id: &str,
        status: CallStatus,
    ) -> Result<Vec<CallRecord>, Error> {
        let sql = format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls c
            WHERE c.execution_id = ? AND c.status = ?
            ORDER BY c.call_id
            "#
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(execution_id)
            .bind(status)
            .fetch_all(&self.pool)
            .await?;

        Ok(calls)
    }

    async fn get_call(
        &self,
        execution_id: &str,
        call_id: i64,
    ) -> Result<Option<CallRecord>, Error> {
        let sql =
            format!("SELECT {CALL_COLUMNS} FROM calls c WHERE c.execution_id = ? AND c.call_id = ?");
        let call = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(execution_id)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(call)
    }

    async fn find_call_by_job_id(&self, job_id: &str) -> Result<Option<CallRecord>, Error> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls c WHERE c.job_id = ? LIMIT 1");
        let call = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(call)
    }

    async fn list_dispatchable_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error> {
        let sql = format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls c
            JOIN executions e ON e.id = c.execution_id
            WHERE c.status = 'pending'
              AND e.status = 'waiting'
              AND e.current_resume_group_id = c.resume_group_id
            ORDER BY c.id
            LIMIT ?
            "#
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(calls)
    }

    async fn list_submitted_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error> {
        let sql = format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls c
            WHERE c.status = 'submitted' AND c.job_id IS NOT NULL
            ORDER BY c.id
            LIMIT ?
            "#
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(calls)
    }

    async fn mark_call_submitted(
        &self,
        execution_id: &str,
        call_id: i64,
        job_id: &str,
    ) -> Result<bool, Error> {
        let result = sqlx::query(
            r#"
            UPDATE calls
            SET status = 'submitted', job_id = ?
            WHERE execution_id = ? AND call_id = ? AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .bind(execution_id)
        .bind(call_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_call(
        &self,
        execution_id: &str,
        call_id: i64,
        result: &Value,
    ) -> Result<bool, Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE calls
            SET status = 'completed', result = ?, completed_at = CURRENT_TIMESTAMP
            WHERE execution_id = ? AND call_id = ? AND status IN ('pending', 'submitted')
            "#,
        )
        .bind(Json(result))
        .bind(execution_id)
        .bind(call_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn fail_call(
        &self,
        execution_id: &str,
        call_id: i64,
        error: &str,
    ) -> Result<bool, Error> {
        let outcome = sqlx::query(
            r#"
            UPDATE calls
            SET status = 'failed', error = ?, completed_at = CURRENT_TIMESTAMP
            WHERE execution_id = ? AND call_id = ? AND status IN ('pending', 'submitted')
            "#,
        )
        .bind(error)
        .bind(execution_id)
        .bind(call_id)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool, Error> {
        let row: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
