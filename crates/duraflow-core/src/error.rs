// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for duraflow-core.
//!
//! Provides a unified error type with stable, machine-readable error codes
//! used by the HTTP API and in logs.

use thiserror::Error;

use crate::engine::EngineError;
use crate::executor::ExecutorError;
use crate::functions::ResolveError;

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating executions.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Execution was not found in the store.
    #[error("Execution '{0}' not found")]
    ExecutionNotFound(String),

    /// Call was not found for the given execution.
    #[error("Call {call_id} not found for execution '{execution_id}'")]
    CallNotFound {
        /// The execution the call was looked up in.
        execution_id: String,
        /// Engine-assigned call id.
        call_id: i64,
    },

    /// No call carries the given executor job id.
    #[error("Job '{0}' not found")]
    JobNotFound(String),

    /// A function reference could not be resolved at submission.
    #[error("Function resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// Two external functions share the same short name.
    #[error("Duplicate external function name '{0}'")]
    DuplicateFunction(String),

    /// The engine blocked on a short name missing from the execution's mapping.
    #[error("Execution '{execution_id}' called unknown external function '{short_name}'")]
    UnknownFunction {
        /// The execution that issued the call.
        execution_id: String,
        /// Short name as referenced in the workflow code.
        short_name: String,
    },

    /// The continuation engine failed or broke its contract.
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// A function executor failed (not the underlying function).
    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Request validation failed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ExecutionNotFound(_) => "EXECUTION_NOT_FOUND",
            Self::CallNotFound { .. } => "CALL_NOT_FOUND",
            Self::JobNotFound(_) => "JOB_NOT_FOUND",
            Self::Resolve(_) => "FUNCTION_RESOLUTION_FAILED",
            Self::DuplicateFunction(_) => "DUPLICATE_FUNCTION",
            Self::UnknownFunction { .. } => "UNKNOWN_FUNCTION",
            Self::Engine(_) => "ENGINE_ERROR",
            Self::Executor(_) => "EXECUTOR_ERROR",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Database { .. } | Self::Migration(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error reports a missing execution, call or job.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ExecutionNotFound(_) | Self::CallNotFound { .. } | Self::JobNotFound(_)
        )
    }

    /// Whether the error was caused by the submitted workflow rather than the infrastructure.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::Resolve(_)
                | Self::DuplicateFunction(_)
                | Self::UnknownFunction { .. }
                | Self::InvalidRequest(_)
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}
