// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for duraflow-core.
//!
//! This module defines the durable record shapes for executions and calls, and the
//! [`Persistence`] trait every storage backend implements. Every method is a single
//! atomic unit; guarded transitions report whether they were applied so callers can
//! detect that a concurrent writer got there first.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::types::Json;

use crate::error::Error;

/// Lifecycle status of an execution.
///
/// ```text
/// scheduled ──► waiting ──► waiting ──► ... ──► completed
///     │            │
///     └────────────┴──────────────────────────► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Submitted, not yet started by a driver.
    Scheduled,
    /// Suspended on its current resume group.
    Waiting,
    /// Finished with an output.
    Completed,
    /// Failed; no further calls are dispatched.
    Failed,
}

impl ExecutionStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Waiting => "waiting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Persisted, not yet handed to an executor.
    Pending,
    /// Handed to an executor; `job_id` is set.
    Submitted,
    /// Finished with a result.
    Completed,
    /// The function or its submission failed.
    Failed,
    /// Abandoned without a result.
    Cancelled,
}

impl CallStatus {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the call will not change status again.
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ExecutionRecord {
    /// Unique identifier for the execution.
    pub id: String,
    /// Workflow program text, opaque to the orchestrator.
    pub code: String,
    /// Short name → qualified function identifier, fixed at submission.
    pub external_functions: Json<BTreeMap<String, String>>,
    /// Named inputs, fixed at submission.
    pub inputs: Json<Map<String, Value>>,
    /// Serialized engine snapshot while waiting.
    pub state: Option<Vec<u8>>,
    /// Current lifecycle status.
    pub status: ExecutionStatus,
    /// Resume group currently outstanding.
    pub current_resume_group_id: Option<String>,
    /// Final return value once completed.
    pub output: Option<Json<Value>>,
    /// Failure reason once failed.
    pub error: Option<String>,
    /// When the execution was submitted.
    pub created_at: DateTime<Utc>,
    /// When the execution last changed.
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Qualified identifier for a short name used in the workflow code.
    pub fn function_identifier(&self, short_name: &str) -> Option<&str> {
        self.external_functions.get(short_name).map(String::as_str)
    }

    /// Short names the workflow may call, sorted.
    pub fn function_names(&self) -> Vec<String> {
        self.external_functions.keys().cloned().collect()
    }
}

/// Call record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CallRecord {
    /// Database primary key.
    pub id: i64,
    /// Execution this call belongs to.
    pub execution_id: String,
    /// Suspension point this call was issued at.
    pub resume_group_id: String,
    /// Engine-assigned id, unique within the execution.
    pub call_id: i64,
    /// Qualified function identifier.
    pub function_name: String,
    /// Positional arguments.
    pub args: Json<Vec<Value>>,
    /// Keyword arguments.
    pub kwargs: Json<Map<String, Value>>,
    /// Current call status.
    pub status: CallStatus,
    /// Executor-assigned handle once submitted.
    pub job_id: Option<String>,
    /// Return value once completed.
    pub result: Option<Json<Value>>,
    /// Error message once failed.
    pub error: Option<String>,
    /// When the call was persisted.
    pub created_at: DateTime<Utc>,
    /// When the call was resolved.
    pub completed_at: Option<DateTime<Utc>>,
}

/// A new execution to persist.
#[derive(Debug, Clone)]
pub struct NewExecution {
    /// Unique identifier for the execution.
    pub id: String,
    /// Workflow program text.
    pub code: String,
    /// Short name → qualified function identifier.
    pub external_functions: BTreeMap<String, String>,
    /// Named inputs.
    pub inputs: Map<String, Value>,
}

/// A new call to persist as part of a resume group.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCall {
    /// Engine-assigned id.
    pub call_id: i64,
    /// Qualified function identifier.
    pub function_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
}

/// The state an execution row must still be in for a guarded transition to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionGuard {
    /// Still scheduled, never started.
    Scheduled,
    /// Still waiting on this exact resume group.
    Waiting(String),
}

impl ExecutionGuard {
    /// Status the row must have.
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Scheduled => ExecutionStatus::Scheduled,
            Self::Waiting(_) => ExecutionStatus::Waiting,
        }
    }

    /// Resume group the row must point at.
    pub fn resume_group_id(&self) -> Option<&str> {
        match self {
            Self::Scheduled => None,
            Self::Waiting(group) => Some(group.as_str()),
        }
    }
}

/// Persistence interface used by the orchestrator and the driver loop.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a new execution with status `scheduled`.
    async fn insert_execution(&self, execution: &NewExecution) -> Result<(), Error>;

    /// Fetch an execution by id.
    async fn get_execution(&self, execution_id: &str) -> Result<Option<ExecutionRecord>, Error>;

    /// List executions, oldest first, optionally filtered by status.
    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ExecutionRecord>, Error>;

    /// Ids of every scheduled or waiting execution, oldest first.
    async fn list_active_execution_ids(&self) -> Result<Vec<String>, Error>;

    /// Atomically persist a suspension: snapshot, status `waiting`, the new current
    /// resume group, and one pending call per entry in `calls`.
    ///
    /// Returns false (and writes nothing) if the row no longer matches `guard`.
    async fn suspend_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        snapshot: &[u8],
        resume_group_id: &str,
        calls: &[NewCall],
    ) -> Result<bool, Error>;

    /// Mark an execution completed with its output, if it still matches `guard`.
    async fn complete_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        output: &Value,
    ) -> Result<bool, Error>;

    /// Mark an execution failed with a reason, if it still matches `guard`.
    async fn fail_execution(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        error: &str,
    ) -> Result<bool, Error>;

    /// Delete an execution and, by cascade, its calls.
    async fn delete_execution(&self, execution_id: &str) -> Result<bool, Error>;

    /// Every call of a resume group, ordered by call id.
    async fn list_group_calls(&self, resume_group_id: &str) -> Result<Vec<CallRecord>, Error>;

    /// Calls of a resume group with the given status, ordered by call id.
    async fn list_group_calls_with_status(
        &self,
        resume_group_id: &str,
        status: CallStatus,
    ) -> Result<Vec<CallRecord>, Error>;

    /// Calls of an execution with the given status, ordered by call id.
    async fn list_execution_calls_with_status(
        &self,
        execution_id: &str,
        status: CallStatus,
    ) -> Result<Vec<CallRecord>, Error>;

    /// Fetch a call by execution id and engine-assigned call id.
    async fn get_call(&self, execution_id: &str, call_id: i64)
    -> Result<Option<CallRecord>, Error>;

    /// Locate a call by its executor job id.
    async fn find_call_by_job_id(&self, job_id: &str) -> Result<Option<CallRecord>, Error>;

    /// Pending calls that belong to the current resume group of a waiting execution.
    async fn list_dispatchable_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error>;

    /// Submitted calls with a job id, oldest first.
    async fn list_submitted_calls(&self, limit: i64) -> Result<Vec<CallRecord>, Error>;

    /// Move a call from `pending` to `submitted` with its job id.
    async fn mark_call_submitted(
        &self,
        execution_id: &str,
        call_id: i64,
        job_id: &str,
    ) -> Result<bool, Error>;

    /// Move an unresolved call to `completed` with its result.
    async fn complete_call(
        &self,
        execution_id: &str,
        call_id: i64,
        result: &Value,
    ) -> Result<bool, Error>;

    /// Move an unresolved call to `failed` with an error message.
    async fn fail_call(&self, execution_id: &str, call_id: i64, error: &str)
    -> Result<bool, Error>;

    /// Check that the database answers queries.
    async fn health_check_db(&self) -> Result<bool, Error>;
}
