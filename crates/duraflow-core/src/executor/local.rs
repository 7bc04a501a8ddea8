// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process executor that runs functions during submission.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::{Executor, ExecutorError, ExecutorStats, JobStatus, JobTable};
use crate::functions::FunctionResolver;

/// Runs each function synchronously inside `submit_call`.
///
/// Submission blocks for the duration of the call, which makes this executor
/// suitable for local use and tests only.
pub struct LocalExecutor {
    resolver: Arc<dyn FunctionResolver>,
    jobs: JobTable,
    executed: AtomicU64,
    failed: AtomicU64,
}

impl LocalExecutor {
    /// Create an executor resolving functions through `resolver`.
    pub fn new(resolver: Arc<dyn FunctionResolver>) -> Self {
        Self {
            resolver,
            jobs: JobTable::default(),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn executor_type(&self) -> &'static str {
        "local"
    }

    async fn submit_call(
        &self,
        function_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, ExecutorError> {
        let function = self.resolver.resolve(function_name)?;
        let job_id = Uuid::new_v4().to_string();

        let status = JobStatus::from_outcome(function.call(args, kwargs));
        if status.error.is_some() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executed.fetch_add(1, Ordering::Relaxed);
        }
        debug!(job_id = %job_id, function = %function_name, state = ?status.state, "Local job ran");

        self.jobs.set(&job_id, status);
        Ok(job_id)
    }

    async fn check_job(&self, job_id: &str) -> Result<JobStatus, ExecutorError> {
        self.jobs.get(job_id)
    }

    fn release_job(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    fn get_stats(&self) -> ExecutorStats {
        ExecutorStats::from([
            ("executed".to_string(), self.executed.load(Ordering::Relaxed)),
            ("failed".to_string(), self.failed.load(Ordering::Relaxed)),
            ("jobs".to_string(), self.jobs.len() as u64),
        ])
    }
}
