// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function executors.
//!
//! An [`Executor`] performs the actual external function invocations on behalf of the
//! driver loop. Three variants are provided:
//!
//! - [`LocalExecutor`]: runs the function inline during submission.
//! - [`QueueExecutor`]: an in-process job queue drained by a fixed set of workers.
//! - [`PushExecutor`]: runs jobs in the background and pushes their outcome to a
//!   [`CompletionSink`] instead of being polled.
//!
//! Executors never touch the store; recording results is the orchestrator's job.

mod local;
mod push;
mod queue;

pub use local::LocalExecutor;
pub use push::{CompletionSink, DeliveryError, PushExecutor};
pub use queue::QueueExecutor;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::functions::{FunctionError, ResolveError};

/// Errors from executor operations.
///
/// These describe failures of the executor itself. A function that runs and raises
/// is reported through [`JobStatus`] instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutorError {
    /// The executor has no record of the job.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The executor does not implement the requested capability.
    #[error("Operation not supported by this executor: {0}")]
    Unsupported(&'static str),

    /// The function could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The executor no longer accepts work.
    #[error("Executor is shut down")]
    ShutDown,

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Lifecycle state of a job inside an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Accepted, not yet running.
    Queued,
    /// Running.
    Started,
    /// Finished with a result.
    Finished,
    /// The function raised.
    Failed,
}

impl JobState {
    /// Whether the job has an outcome.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Status of a job as reported by `check_job`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    /// Current state.
    pub state: JobState,
    /// Return value when finished.
    pub result: Option<Value>,
    /// Error message when failed.
    pub error: Option<String>,
}

impl JobStatus {
    /// Accepted, not yet running.
    pub fn queued() -> Self {
        Self {
            state: JobState::Queued,
            result: None,
            error: None,
        }
    }

    /// Running.
    pub fn started() -> Self {
        Self {
            state: JobState::Started,
            result: None,
            error: None,
        }
    }

    /// Finished with a result.
    pub fn finished(result: Value) -> Self {
        Self {
            state: JobState::Finished,
            result: Some(result),
            error: None,
        }
    }

    /// Failed with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Status for a function outcome.
    pub fn from_outcome(outcome: Result<Value, FunctionError>) -> Self {
        match outcome {
            Ok(value) => Self::finished(value),
            Err(e) => Self::failed(e.message()),
        }
    }
}

/// Outcome of a job pushed back to the orchestrator, as received by the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Executor-assigned job id.
    pub job_id: String,
    /// `finished` or `failed`.
    pub status: JobState,
    /// Return value when finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    /// Build a report from a finished or failed job status.
    pub fn from_status(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status: status.state,
            result: status.result,
            error: status.error,
        }
    }
}

/// Diagnostic counters, best effort.
pub type ExecutorStats = BTreeMap<String, u64>;

/// Trait for function executors.
///
/// Executors are pure execution engines; they do NOT access the database.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executor type identifier (e.g. "local", "queue", "push").
    fn executor_type(&self) -> &'static str;

    /// Hand a call to the executor and return its job id.
    ///
    /// Must not wait for the function to finish, except in the local variant.
    async fn submit_call(
        &self,
        function_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, ExecutorError>;

    /// Whether `check_job` is implemented. Push-style executors return false and the
    /// driver loop skips its polling phase for them.
    fn supports_check_job(&self) -> bool {
        true
    }

    /// Current status of a submitted job.
    async fn check_job(&self, job_id: &str) -> Result<JobStatus, ExecutorError> {
        let _ = job_id;
        Err(ExecutorError::Unsupported("check_job"))
    }

    /// Drop the executor's record of a job whose outcome has been recorded.
    ///
    /// Called by the driver loop after harvesting a finished or failed job. Later
    /// `check_job` calls for it return [`ExecutorError::JobNotFound`].
    fn release_job(&self, job_id: &str) {
        let _ = job_id;
    }

    /// Diagnostic counters.
    fn get_stats(&self) -> ExecutorStats;
}

/// Job statuses keyed by job id, shared by the polled executors.
///
/// Entries live until the driver loop releases them. Finished and failed jobs are
/// also counted cumulatively so stats survive eviction.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: Mutex<HashMap<String, JobStatus>>,
    finished: AtomicU64,
    failed: AtomicU64,
}

impl JobTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobStatus>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, job_id: &str, status: JobStatus) {
        match status.state {
            JobState::Finished => {
                self.finished.fetch_add(1, Ordering::Relaxed);
            }
            JobState::Failed => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            JobState::Queued | JobState::Started => {}
        }
        self.lock().insert(job_id.to_string(), status);
    }

    pub(crate) fn get(&self, job_id: &str) -> Result<JobStatus, ExecutorError> {
        self.lock()
            .get(job_id)
            .cloned()
            .ok_or_else(|| ExecutorError::JobNotFound(job_id.to_string()))
    }

    /// Forget a job. Returns whether it was known.
    pub(crate) fn remove(&self, job_id: &str) -> bool {
        self.lock().remove(job_id).is_some()
    }

    /// Jobs currently held.
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    /// Live jobs per state, plus cumulative finished and failed totals.
    pub(crate) fn counts(&self) -> HashMap<JobState, u64> {
        let mut counts = HashMap::new();
        for status in self.lock().values() {
            if !status.state.is_done() {
                *counts.entry(status.state).or_insert(0) += 1;
            }
        }
        for (state, total) in [
            (JobState::Finished, self.finished.load(Ordering::Relaxed)),
            (JobState::Failed, self.failed.load(Ordering::Relaxed)),
        ] {
            if total > 0 {
                counts.insert(state, total);
            }
        }
        counts
    }
}

/// Functions shared by executor, orchestrator and worker tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Map, Value, json};

    use crate::functions::{FunctionError, FunctionRegistry, positional};

    fn add(args: &[Value], _: &Map<String, Value>) -> Result<Value, FunctionError> {
        let a = positional(args, 0)?.as_i64().ok_or("a must be an integer")?;
        let b = positional(args, 1)?.as_i64().ok_or("b must be an integer")?;
        Ok(json!(a + b))
    }

    fn explode(_: &[Value], _: &Map<String, Value>) -> Result<Value, FunctionError> {
        Err(FunctionError::new("exploded"))
    }

    fn slow(args: &[Value], _: &Map<String, Value>) -> Result<Value, FunctionError> {
        std::thread::sleep(Duration::from_millis(50));
        Ok(positional(args, 0)?.clone())
    }

    /// `math.add`, `math.explode` and `math.slow`.
    pub(crate) fn registry() -> Arc<FunctionRegistry> {
        let mut registry = FunctionRegistry::new();
        registry.register("math.add", add).unwrap();
        registry.register("math.explode", explode).unwrap();
        registry.register("math.slow", slow).unwrap();
        Arc::new(registry)
    }
}
