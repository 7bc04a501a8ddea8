// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Push-style executor.
//!
//! Jobs run in the background and their outcome is pushed to a [`CompletionSink`],
//! the same way a remote worker would call the completion webhook. There is no
//! `check_job`; the driver loop skips its polling phase for this executor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Executor, ExecutorError, ExecutorStats, JobReport, JobStatus};
use crate::functions::FunctionResolver;

/// Why a pushed job outcome was not accepted.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The receiver does not know the job id (yet).
    #[error("Job '{0}' is not known")]
    UnknownJob(String),

    /// The receiver failed to record the outcome.
    #[error("Delivery failed: {0}")]
    Failed(String),
}

/// Receiver of pushed job outcomes.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    /// Record the outcome of a job.
    async fn deliver(&self, report: JobReport) -> Result<(), DeliveryError>;
}

#[derive(Default)]
struct PushStats {
    submitted: AtomicU64,
    delivered: AtomicU64,
    undeliverable: AtomicU64,
}

/// Executor that runs jobs in the background and pushes their outcome.
pub struct PushExecutor {
    resolver: Arc<dyn FunctionResolver>,
    sink: Arc<dyn CompletionSink>,
    max_attempts: u32,
    retry_delay: Duration,
    stats: Arc<PushStats>,
}

impl PushExecutor {
    /// Create an executor pushing outcomes to `sink`.
    ///
    /// By default an outcome for a job id the sink does not know yet is retried
    /// 50 times, 20ms apart. The job id is only recorded once the driver loop has
    /// committed the submission, which can lag behind a fast function.
    pub fn new(resolver: Arc<dyn FunctionResolver>, sink: Arc<dyn CompletionSink>) -> Self {
        Self {
            resolver,
            sink,
            max_attempts: 50,
            retry_delay: Duration::from_millis(20),
            stats: Arc::new(PushStats::default()),
        }
    }

    /// Override the delivery retry policy.
    pub fn with_retry(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = retry_delay;
        self
    }
}

async fn deliver(
    sink: Arc<dyn CompletionSink>,
    report: JobReport,
    max_attempts: u32,
    retry_delay: Duration,
    stats: Arc<PushStats>,
) {
    for attempt in 1..=max_attempts {
        match sink.deliver(report.clone()).await {
            Ok(()) => {
                debug!(job_id = %report.job_id, attempt, "Job outcome delivered");
                stats.delivered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(DeliveryError::UnknownJob(_)) if attempt < max_attempts => {
                tokio::time::sleep(retry_delay).await;
            }
            Err(e) => {
                warn!(job_id = %report.job_id, attempt, error = %e, "Dropping job outcome");
                stats.undeliverable.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

#[async_trait]
impl Executor for PushExecutor {
    fn executor_type(&self) -> &'static str {
        "push"
    }

    async fn submit_call(
        &self,
        function_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, ExecutorError> {
        let function = self.resolver.resolve(function_name)?;
        let job_id = Uuid::new_v4().to_string();
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);

        let args = args.to_vec();
        let kwargs = kwargs.clone();
        let sink = self.sink.clone();
        let stats = self.stats.clone();
        let (max_attempts, retry_delay) = (self.max_attempts, self.retry_delay);
        let report_id = job_id.clone();

        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || function.call(&args, &kwargs)).await;
            let status = match outcome {
                Ok(outcome) => JobStatus::from_outcome(outcome),
                Err(e) => JobStatus::failed(format!("function panicked: {}", e)),
            };
            let report = JobReport::from_status(report_id, status);
            deliver(sink, report, max_attempts, retry_delay, stats).await;
        });

        Ok(job_id)
    }

    fn supports_check_job(&self) -> bool {
        false
    }

    fn get_stats(&self) -> ExecutorStats {
        ExecutorStats::from([
            (
                "submitted".to_string(),
                self.stats.submitted.load(Ordering::Relaxed),
            ),
            (
                "delivered".to_string(),
                self.stats.delivered.load(Ordering::Relaxed),
            ),
            (
                "undeliverable".to_string(),
                self.stats.undeliverable.load(Ordering::Relaxed),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::executor::JobState;
    use crate::executor::testing::registry;
    use serde_json::json;

    /// Sink rejecting the first `reject` deliveries as unknown.
    #[derive(Default)]
    struct RecordingSink {
        reject: AtomicU64,
        reports: Mutex<Vec<JobReport>>,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn deliver(&self, report: JobReport) -> Result<(), DeliveryError> {
            let remaining = self.reject.load(Ordering::SeqCst);
            if remaining > 0 {
                self.reject.store(remaining - 1, Ordering::SeqCst);
                return Err(DeliveryError::UnknownJob(report.job_id));
            }
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    async fn wait_for_stat(executor: &PushExecutor, name: &str, value: u64) {
        for _ in 0..200 {
            if executor.get_stats()[name] >= value {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("stat {} never reached {}", name, value);
    }

    #[tokio::test]
    async fn test_outcomes_are_pushed() {
        let sink = Arc::new(RecordingSink::default());
        let executor = PushExecutor::new(registry(), sink.clone());

        let ok = executor
            .submit_call("math.add", &[json!(4), json!(5)], &Map::new())
            .await
            .unwrap();
        let failed = executor
            .submit_call("math.explode", &[], &Map::new())
            .await
            .unwrap();
        wait_for_stat(&executor, "delivered", 2).await;

        let reports = sink.reports.lock().unwrap().clone();
        let ok_report = reports.iter().find(|r| r.job_id == ok).unwrap();
        assert_eq!(ok_report.status, JobState::Finished);
        assert_eq!(ok_report.result, Some(json!(9)));
        let failed_report = reports.iter().find(|r| r.job_id == failed).unwrap();
        assert_eq!(failed_report.status, JobState::Failed);
        assert_eq!(failed_report.error.as_deref(), Some("exploded"));
    }

    #[tokio::test]
    async fn test_unknown_job_is_retried() {
        let sink = Arc::new(RecordingSink {
            reject: AtomicU64::new(3),
            ..Default::default()
        });
        let executor = PushExecutor::new(registry(), sink.clone())
            .with_retry(10, Duration::from_millis(1));

        executor
            .submit_call("math.add", &[json!(1), json!(1)], &Map::new())
            .await
            .unwrap();
        wait_for_stat(&executor, "delivered", 1).await;
        assert_eq!(sink.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let sink = Arc::new(RecordingSink {
            reject: AtomicU64::new(100),
            ..Default::default()
        });
        let executor = PushExecutor::new(registry(), sink.clone())
            .with_retry(3, Duration::from_millis(1));

        executor
            .submit_call("math.add", &[json!(1), json!(1)], &Map::new())
            .await
            .unwrap();
        wait_for_stat(&executor, "undeliverable", 1).await;
        assert!(sink.reports.lock().unwrap().is_empty());
        assert_eq!(sink.reject.load(Ordering::SeqCst), 97);
    }

    #[tokio::test]
    async fn test_check_job_is_unsupported() {
        let executor = PushExecutor::new(registry(), Arc::new(RecordingSink::default()));
        assert!(!executor.supports_check_job());
        assert!(matches!(
            executor.check_job("any").await,
            Err(ExecutorError::Unsupported(_))
        ));
    }
}
