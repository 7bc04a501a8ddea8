// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution coordinator.
//!
//! The [`Orchestrator`] owns the execution lifecycle:
//!
//! ```text
//!   start_execution ──► scheduled
//!                           │ process_execution
//!                           ▼
//!                  ┌──► waiting(group) ──── poll: a call failed ───► failed
//!                  │        │
//!                  │        │ poll: every call completed
//!                  │        ▼
//!                  └── process_execution(group) ───────────────────► completed
//! ```
//!
//! It is the only component talking to the [`ContinuationEngine`]. All state lives in
//! the store, and every transition is a guarded write against the status and resume
//! group the orchestrator read, so any number of orchestrators may share one store.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::{Continuation, ContinuationEngine, EngineError, ExternalCall, Resume, Step};
use crate::error::{Error, Result};
use crate::executor::{CompletionSink, DeliveryError, JobReport, JobState};
use crate::functions::{FunctionRef, FunctionResolver};
use crate::persistence::{
    CallRecord, CallStatus, ExecutionGuard, ExecutionRecord, ExecutionStatus, NewCall,
    NewExecution, Persistence,
};

/// What `process_execution` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing: the execution was not in the expected state, or another writer
    /// advanced it first.
    Skipped,
    /// The engine blocked and a new resume group was created.
    Suspended {
        /// The new current resume group.
        resume_group_id: String,
        /// Number of calls in the group.
        calls: usize,
    },
    /// The engine finished and the output was stored.
    Completed,
    /// The program failed and the execution was marked failed.
    Failed,
}

/// Result of a call status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallUpdate {
    /// The call was unresolved and now carries the outcome.
    Applied,
    /// The call was already resolved; nothing changed.
    AlreadyResolved,
    /// No such call.
    NotFound,
}

/// Execution status as seen by a poller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollStatus {
    /// Scheduled or waiting on calls.
    Pending,
    /// Finished with an output.
    Completed,
    /// Failed.
    Failed,
}

/// An unresolved call, for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingCallView {
    /// Engine-assigned call id.
    pub call_id: i64,
    /// Qualified function identifier.
    pub function_name: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Map<String, Value>,
    /// `pending` or `submitted`.
    pub status: CallStatus,
}

impl From<&CallRecord> for PendingCallView {
    fn from(call: &CallRecord) -> Self {
        Self {
            call_id: call.call_id,
            function_name: call.function_name.clone(),
            args: call.args.0.clone(),
            kwargs: call.kwargs.0.clone(),
            status: call.status,
        }
    }
}

/// Snapshot of an execution returned by `poll`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollReport {
    /// Execution id.
    pub execution_id: String,
    /// Current status.
    pub status: PollStatus,
    /// Output once completed.
    pub output: Option<Value>,
    /// Failure reason once failed.
    pub error: Option<String>,
    /// Unresolved calls of the current resume group.
    pub pending_calls: Vec<PendingCallView>,
}

impl PollReport {
    fn pending(execution_id: &str, pending_calls: Vec<PendingCallView>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            status: PollStatus::Pending,
            output: None,
            error: None,
            pending_calls,
        }
    }

    fn terminal(record: &ExecutionRecord) -> Self {
        let status = match record.status {
            ExecutionStatus::Completed => PollStatus::Completed,
            ExecutionStatus::Failed => PollStatus::Failed,
            _ => PollStatus::Pending,
        };
        Self {
            execution_id: record.id.clone(),
            status,
            output: record.output.as_ref().map(|output| output.0.clone()),
            error: record.error.clone(),
            pending_calls: Vec::new(),
        }
    }

    /// Whether the execution reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status != PollStatus::Pending
    }
}

/// A job report matched to its call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedCall {
    /// Execution the call belongs to.
    pub execution_id: String,
    /// Engine-assigned call id.
    pub call_id: i64,
    /// What the report changed.
    pub update: CallUpdate,
}

/// How the engine left off after draining its blocked calls.
enum Drained {
    Done(Value),
    Suspended {
        snapshot: Vec<u8>,
        calls: Vec<ExternalCall>,
    },
}

/// Run the engine forward, acknowledging every blocked call as a future, until it
/// completes or reports the set of calls it is durably blocked on.
fn drain(
    mut continuation: Box<dyn Continuation>,
    input: Resume,
) -> std::result::Result<Drained, EngineError> {
    let mut blocked: BTreeMap<i64, ExternalCall> = BTreeMap::new();
    let mut step = continuation.advance(input)?;

    loop {
        match step {
            Step::Blocked(call) => {
                if blocked.contains_key(&call.call_id) {
                    return Err(EngineError::Protocol(format!(
                        "call id {} issued twice",
                        call.call_id
                    )));
                }
                blocked.insert(call.call_id, call);
                step = continuation.advance(Resume::Future)?;
            }
            Step::Done(output) => return Ok(Drained::Done(output)),
            Step::Suspended { pending_call_ids } => {
                if pending_call_ids.is_empty() {
                    return Err(EngineError::Protocol(
                        "suspended without pending calls".to_string(),
                    ));
                }
                let mut seen = HashSet::new();
                let mut calls = Vec::with_capacity(pending_call_ids.len());
                for call_id in pending_call_ids {
                    if !seen.insert(call_id) {
                        continue;
                    }
                    let call = blocked.remove(&call_id).ok_or_else(|| {
                        EngineError::Protocol(format!("suspended on unknown call id {}", call_id))
                    })?;
                    calls.push(call);
                }
                let snapshot = continuation.dump()?;
                return Ok(Drained::Suspended { snapshot, calls });
            }
        }
    }
}

/// The execution coordinator.
pub struct Orchestrator {
    persistence: Arc<dyn Persistence>,
    engine: Arc<dyn ContinuationEngine>,
    resolver: Arc<dyn FunctionResolver>,
}

impl Orchestrator {
    /// Create a coordinator over a store, an engine, and a resolver for
    /// unqualified function references.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        engine: Arc<dyn ContinuationEngine>,
        resolver: Arc<dyn FunctionResolver>,
    ) -> Self {
        Self {
            persistence,
            engine,
            resolver,
        }
    }

    /// The underlying store.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Submit a new execution and return its id.
    ///
    /// Every function reference is resolved to a `short_name → qualified identifier`
    /// entry before anything is persisted; an unresolvable, ambiguous or duplicate
    /// reference fails the submission.
    #[instrument(skip_all)]
    pub async fn start_execution<I, F>(
        &self,
        code: &str,
        external_functions: I,
        inputs: Map<String, Value>,
    ) -> Result<String>
    where
        I: IntoIterator<Item = F> + Send,
        F: Into<FunctionRef>,
    {
        let mut mapping = BTreeMap::new();
        for reference in external_functions {
            let (short_name, identifier) = reference.into().resolve_with(self.resolver.as_ref())?;
            if mapping.contains_key(&short_name) {
                return Err(Error::DuplicateFunction(short_name));
            }
            mapping.insert(short_name, identifier);
        }

        let execution = NewExecution {
            id: Uuid::new_v4().to_string(),
            code: code.to_string(),
            external_functions: mapping,
            inputs,
        };
        self.persistence.insert_execution(&execution).await?;

        info!(
            execution_id = %execution.id,
            functions = ?execution.external_functions,
            "Execution scheduled"
        );
        Ok(execution.id)
    }

    /// Fetch the raw execution record.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionRecord> {
        self.persistence
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| Error::ExecutionNotFound(execution_id.to_string()))
    }

    /// Start a scheduled execution (`resume_group_id == None`), or resume a waiting
    /// one with the results of its current resume group.
    ///
    /// Any other combination, including a stale resume group id, is a no-op.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn process_execution(
        &self,
        execution_id: &str,
        resume_group_id: Option<&str>,
    ) -> Result<ProcessOutcome> {
        let record = self.get_execution(execution_id).await?;

        let (guard, started) = match (record.status, resume_group_id) {
            (ExecutionStatus::Scheduled, None) => {
                let names = record.function_names();
                let started = self
                    .engine
                    .start(&record.code, &names, &record.inputs)
                    .map(|continuation| (continuation, Resume::Start));
                (ExecutionGuard::Scheduled, started)
            }
            (ExecutionStatus::Waiting, Some(group))
                if record.current_resume_group_id.as_deref() == Some(group) =>
            {
                let guard = ExecutionGuard::Waiting(group.to_string());
                let results: BTreeMap<i64, Value> = self
                    .persistence
                    .list_group_calls_with_status(group, CallStatus::Completed)
                    .await?
                    .into_iter()
                    .map(|call| (call.call_id, call.result.map(|r| r.0).unwrap_or(Value::Null)))
                    .collect();
                let snapshot = record.state.as_deref().ok_or_else(|| {
                    EngineError::Snapshot("waiting execution has no snapshot".to_string())
                })?;
                let started = self
                    .engine
                    .load(snapshot)
                    .map(|continuation| (continuation, Resume::Results(results)));
                (guard, started)
            }
            (status, group) => {
                debug!(
                    status = %status,
                    requested_group = ?group,
                    current_group = ?record.current_resume_group_id,
                    "Skipping execution not in the requested state"
                );
                return Ok(ProcessOutcome::Skipped);
            }
        };

        let drained = started.and_then(|(continuation, input)| drain(continuation, input));
        let drained = match drained {
            Ok(drained) => drained,
            Err(e) if e.is_program_error() => {
                warn!(error = %e, "Workflow program failed");
                return self.fail(&record.id, &guard, &e.to_string()).await;
            }
            Err(e) => return Err(e.into()),
        };

        match drained {
            Drained::Done(output) => {
                if !self
                    .persistence
                    .complete_execution(&record.id, &guard, &output)
                    .await?
                {
                    debug!("Execution advanced concurrently, completion discarded");
                    return Ok(ProcessOutcome::Skipped);
                }
                info!("Execution completed");
                Ok(ProcessOutcome::Completed)
            }
            Drained::Suspended { snapshot, calls } => {
                let mut new_calls = Vec::with_capacity(calls.len());
                for call in calls {
                    let Some(identifier) = record.function_identifier(&call.function_name) else {
                        let err = Error::UnknownFunction {
                            execution_id: record.id.clone(),
                            short_name: call.function_name,
                        };
                        error!(error = %err, "Engine blocked on an unmapped function");
                        return self.fail(&record.id, &guard, &err.to_string()).await;
                    };
                    new_calls.push(NewCall {
                        call_id: call.call_id,
                        function_name: identifier.to_string(),
                        args: call.args,
                        kwargs: call.kwargs,
                    });
                }

                let group = Uuid::new_v4().to_string();
                if !self
                    .persistence
                    .suspend_execution(&record.id, &guard, &snapshot, &group, &new_calls)
                    .await?
                {
                    debug!("Execution advanced concurrently, suspension discarded");
                    return Ok(ProcessOutcome::Skipped);
                }
                info!(
                    resume_group_id = %group,
                    calls = new_calls.len(),
                    "Execution waiting on resume group"
                );
                Ok(ProcessOutcome::Suspended {
                    resume_group_id: group,
                    calls: new_calls.len(),
                })
            }
        }
    }

    async fn fail(
        &self,
        execution_id: &str,
        guard: &ExecutionGuard,
        reason: &str,
    ) -> Result<ProcessOutcome> {
        if self
            .persistence
            .fail_execution(execution_id, guard, reason)
            .await?
        {
            info!(execution_id = %execution_id, reason = %reason, "Execution failed");
            Ok(ProcessOutcome::Failed)
        } else {
            Ok(ProcessOutcome::Skipped)
        }
    }

    /// Report the state of an execution, advancing it when its current resume group
    /// has fully resolved.
    ///
    /// The engine is resumed only once every call of the group has completed. A
    /// failed or cancelled call fails the whole execution instead.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn poll(&self, execution_id: &str) -> Result<PollReport> {
        loop {
            let record = self.get_execution(execution_id).await?;

            if record.status.is_terminal() {
                return Ok(PollReport::terminal(&record));
            }
            let Some(group) = record
                .current_resume_group_id
                .clone()
                .filter(|_| record.status == ExecutionStatus::Waiting)
            else {
                return Ok(PollReport::pending(execution_id, Vec::new()));
            };

            let calls = self.persistence.list_group_calls(&group).await?;
            let unresolved: Vec<PendingCallView> = calls
                .iter()
                .filter(|call| !call.status.is_resolved())
                .map(PendingCallView::from)
                .collect();
            if !unresolved.is_empty() {
                return Ok(PollReport::pending(execution_id, unresolved));
            }

            let guard = ExecutionGuard::Waiting(group.clone());
            if let Some(call) = calls.iter().find(|call| call.status != CallStatus::Completed) {
                let reason = match call.status {
                    CallStatus::Cancelled => format!(
                        "call {} ({}) was cancelled",
                        call.call_id, call.function_name
                    ),
                    _ => format!(
                        "call {} ({}) failed: {}",
                        call.call_id,
                        call.function_name,
                        call.error.as_deref().unwrap_or("unknown error")
                    ),
                };
                self.fail(execution_id, &guard, &reason).await?;
            } else {
                self.process_execution(execution_id, Some(&group)).await?;
            }
            // Re-read to report the new state
        }
    }

    /// Poll every scheduled or waiting execution.
    ///
    /// A failure on one execution is logged and does not stop the others.
    pub async fn poll_all(&self) -> Result<Vec<PollReport>> {
        let ids = self.persistence.list_active_execution_ids().await?;
        let mut reports = Vec::with_capacity(ids.len());

        for execution_id in ids {
            match self.poll(&execution_id).await {
                Ok(report) => reports.push(report),
                Err(Error::ExecutionNotFound(_)) => {
                    debug!(execution_id = %execution_id, "Execution deleted while polling");
                }
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Failed to poll execution");
                }
            }
        }

        Ok(reports)
    }

    /// Record the result of a call.
    ///
    /// Late or duplicate reports are harmless: a call that already resolved keeps
    /// its first outcome.
    #[instrument(skip(self, result))]
    pub async fn complete_call(
        &self,
        execution_id: &str,
        call_id: i64,
        result: Value,
    ) -> Result<CallUpdate> {
        if self
            .persistence
            .complete_call(execution_id, call_id, &result)
            .await?
        {
            debug!("Call completed");
            return Ok(CallUpdate::Applied);
        }
        self.unapplied(execution_id, call_id).await
    }

    /// Record the failure of a call. Mirrors [`Orchestrator::complete_call`].
    #[instrument(skip(self))]
    pub async fn fail_call(
        &self,
        execution_id: &str,
        call_id: i64,
        error: &str,
    ) -> Result<CallUpdate> {
        if self
            .persistence
            .fail_call(execution_id, call_id, error)
            .await?
        {
            debug!("Call failed");
            return Ok(CallUpdate::Applied);
        }
        self.unapplied(execution_id, call_id).await
    }

    async fn unapplied(&self, execution_id: &str, call_id: i64) -> Result<CallUpdate> {
        let update = match self.persistence.get_call(execution_id, call_id).await? {
            Some(_) => CallUpdate::AlreadyResolved,
            None => CallUpdate::NotFound,
        };
        debug!(execution_id = %execution_id, call_id, update = ?update, "Call update not applied");
        Ok(update)
    }

    /// Apply a pushed job outcome to the call carrying its job id.
    #[instrument(skip(self, report), fields(job_id = %report.job_id))]
    pub async fn report_job(&self, report: JobReport) -> Result<ReportedCall> {
        let call = self
            .persistence
            .find_call_by_job_id(&report.job_id)
            .await?
            .ok_or_else(|| Error::JobNotFound(report.job_id.clone()))?;

        let update = match report.status {
            JobState::Finished => {
                self.complete_call(
                    &call.execution_id,
                    call.call_id,
                    report.result.unwrap_or(Value::Null),
                )
                .await?
            }
            JobState::Failed => {
                let error = report.error.as_deref().unwrap_or("job failed");
                self.fail_call(&call.execution_id, call.call_id, error).await?
            }
            state => {
                return Err(Error::InvalidRequest(format!(
                    "job report must be finished or failed, got {:?}",
                    state
                )));
            }
        };

        Ok(ReportedCall {
            execution_id: call.execution_id,
            call_id: call.call_id,
            update,
        })
    }

    /// Pending calls of an execution, across all its resume groups.
    pub async fn get_pending_calls(&self, execution_id: &str) -> Result<Vec<CallRecord>> {
        self.get_execution(execution_id).await?;
        self.persistence
            .list_execution_calls_with_status(execution_id, CallStatus::Pending)
            .await
    }

    /// Delete an execution and all its calls.
    #[instrument(skip(self))]
    pub async fn delete_execution(&self, execution_id: &str) -> Result<()> {
        if self.persistence.delete_execution(execution_id).await? {
            info!("Execution deleted");
            Ok(())
        } else {
            Err(Error::ExecutionNotFound(execution_id.to_string()))
        }
    }
}

#[async_trait]
impl CompletionSink for Orchestrator {
    async fn deliver(&self, report: JobReport) -> std::result::Result<(), DeliveryError> {
        match self.report_job(report).await {
            Ok(_) => Ok(()),
            Err(Error::JobNotFound(job_id)) => Err(DeliveryError::UnknownJob(job_id)),
            Err(e) => Err(DeliveryError::Failed(e.to_string())),
        }
    }
}
