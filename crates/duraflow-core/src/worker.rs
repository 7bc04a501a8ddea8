// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Driver loop.
//!
//! Each tick runs four independent phases:
//!
//! 1. start every scheduled execution;
//! 2. submit pending calls of current resume groups to the executor;
//! 3. harvest submitted calls from executors that support `check_job`;
//! 4. poll every active execution, resuming those whose group has resolved.
//!
//! Failures are logged per item and never abort the rest of the tick. Anything left
//! behind is picked up again on the next tick by re-selecting the same rows.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::executor::{Executor, ExecutorError, JobState};
use crate::orchestrator::{CallUpdate, Orchestrator, ProcessOutcome};
use crate::persistence::{CallRecord, ExecutionStatus};

/// Driver loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// Maximum pending calls submitted per tick.
    pub submit_batch_size: i64,
    /// Maximum submitted calls checked per tick.
    pub check_batch_size: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            submit_batch_size: 10,
            check_batch_size: 50,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Scheduled executions started.
    pub started: usize,
    /// Calls handed to the executor.
    pub submitted: usize,
    /// Calls failed because the executor rejected them.
    pub submit_failures: usize,
    /// Calls completed from a finished job.
    pub harvested: usize,
    /// Calls failed from a failed job.
    pub call_failures: usize,
    /// Executions that reached a terminal status while polling.
    pub advanced: usize,
}

impl TickReport {
    /// Whether the tick changed nothing.
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// The driver loop.
pub struct Worker {
    orchestrator: Arc<Orchestrator>,
    executor: Arc<dyn Executor>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    /// Create a driver loop.
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        executor: Arc<dyn Executor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            orchestrator,
            executor,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Get a handle to signal shutdown.
    ///
    /// Cancelling is sticky: a signal sent mid-tick stops the loop right after
    /// that tick.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run ticks until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            submit_batch_size = self.config.submit_batch_size,
            check_batch_size = self.config.check_batch_size,
            executor = self.executor.executor_type(),
            "Driver loop started"
        );

        while !self.shutdown.is_cancelled() {
            let report = self.run_once().await;
            if !report.is_idle() {
                debug!(?report, "Tick complete");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!("Driver loop stopped");
    }

    /// Run a single tick.
    pub async fn run_once(&self) -> TickReport {
        let mut report = TickReport::default();
        self.start_scheduled(&mut report).await;
        self.submit_pending(&mut report).await;
        if self.executor.supports_check_job() {
            self.harvest_submitted(&mut report).await;
        }
        self.advance(&mut report).await;
        report
    }

    async fn start_scheduled(&self, report: &mut TickReport) {
        let scheduled = match self
            .orchestrator
            .persistence()
            .list_executions(Some(ExecutionStatus::Scheduled), i64::MAX, 0)
            .await
        {
            Ok(scheduled) => scheduled,
            Err(e) => {
                error!(error = %e, "Failed to list scheduled executions");
                return;
            }
        };

        for execution in scheduled {
            match self.orchestrator.process_execution(&execution.id, None).await {
                Ok(ProcessOutcome::Skipped) => {}
                Ok(_) => report.started += 1,
                Err(e) => {
                    error!(execution_id = %execution.id, error = %e, "Failed to start execution");
                }
            }
        }
    }

    async fn submit_pending(&self, report: &mut TickReport) {
        let pending = match self
            .orchestrator
            .persistence()
            .list_dispatchable_calls(self.config.submit_batch_size)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to list pending calls");
                return;
            }
        };

        for call in pending {
            match self.submit(&call).await {
                Ok(true) => report.submitted += 1,
                Ok(false) => report.submit_failures += 1,
                Err(e) => {
                    error!(
                        execution_id = %call.execution_id,
                        call_id = call.call_id,
                        error = %e,
                        "Failed to record call submission"
                    );
                }
            }
        }
    }

    /// Submit one call. Returns whether the executor accepted it.
    async fn submit(&self, call: &CallRecord) -> crate::error::Result<bool> {
        let persistence = self.orchestrator.persistence();

        match self
            .executor
            .submit_call(&call.function_name, &call.args, &call.kwargs)
            .await
        {
            Ok(job_id) => {
                if !persistence
                    .mark_call_submitted(&call.execution_id, call.call_id, &job_id)
                    .await?
                {
                    warn!(
                        execution_id = %call.execution_id,
                        call_id = call.call_id,
                        job_id = %job_id,
                        "Call changed before its submission was recorded"
                    );
                }
                debug!(
                    execution_id = %call.execution_id,
                    call_id = call.call_id,
                    job_id = %job_id,
                    "Call submitted"
                );
                Ok(true)
            }
            Err(e) => {
                warn!(
                    execution_id = %call.execution_id,
                    call_id = call.call_id,
                    function = %call.function_name,
                    error = %e,
                    "Executor rejected call"
                );
                self.orchestrator
                    .fail_call(&call.execution_id, call.call_id, &e.to_string())
                    .await?;
                Ok(false)
            }
        }
    }

    async fn harvest_submitted(&self, report: &mut TickReport) {
        let submitted = match self
            .orchestrator
            .persistence()
            .list_submitted_calls(self.config.check_batch_size)
            .await
        {
            Ok(submitted) => submitted,
            Err(e) => {
                error!(error = %e, "Failed to list submitted calls");
                return;
            }
        };

        for call in submitted {
            let Some(job_id) = call.job_id.as_deref() else {
                continue;
            };

            let outcome = match self.executor.check_job(job_id).await {
                Ok(status) => match status.state {
                    JobState::Finished => self
                        .orchestrator
                        .complete_call(
                            &call.execution_id,
                            call.call_id,
                            status.result.unwrap_or_default(),
                        )
                        .await
                        .map(|update| (update, false)),
                    JobState::Failed => self
                        .orchestrator
                        .fail_call(
                            &call.execution_id,
                            call.call_id,
                            status.error.as_deref().unwrap_or("job failed"),
                        )
                        .await
                        .map(|update| (update, true)),
                    JobState::Queued | JobState::Started => continue,
                },
                Err(ExecutorError::JobNotFound(_)) => {
                    // The executor lost the job, e.g. across a restart
                    self.orchestrator
                        .fail_call(&call.execution_id, call.call_id, "job lost by executor")
                        .await
                        .map(|update| (update, true))
                }
                Err(e) => {
                    error!(
                        execution_id = %call.execution_id,
                        call_id = call.call_id,
                        job_id = %job_id,
                        error = %e,
                        "Failed to check job"
                    );
                    continue;
                }
            };

            if outcome.is_ok() {
                self.executor.release_job(job_id);
            }
            match outcome {
                Ok((CallUpdate::Applied, false)) => report.harvested += 1,
                Ok((CallUpdate::Applied, true)) => report.call_failures += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(
                        execution_id = %call.execution_id,
                        call_id = call.call_id,
                        error = %e,
                        "Failed to record job outcome"
                    );
                }
            }
        }
    }

    async fn advance(&self, report: &mut TickReport) {
        match self.orchestrator.poll_all().await {
            Ok(reports) => {
                report.advanced += reports.iter().filter(|r| r.is_terminal()).count();
            }
            Err(e) => error!(error = %e, "Failed to poll executions"),
        }
    }
}
