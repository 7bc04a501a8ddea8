// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process asynchronous job queue.
//!
//! Submissions are pushed onto an unbounded channel and return immediately. A fixed
//! number of worker tasks take jobs off the channel and run each function on the
//! blocking pool, recording `queued → started → finished | failed` as they go.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Executor, ExecutorError, ExecutorStats, JobState, JobStatus, JobTable};
use crate::functions::{ExternalFunction, FunctionResolver};

struct Job {
    job_id: String,
    function: Arc<dyn ExternalFunction>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>>;

/// Queue-backed executor with a pool of worker tasks.
pub struct QueueExecutor {
    resolver: Arc<dyn FunctionResolver>,
    jobs: Arc<JobTable>,
    sender: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueExecutor {
    /// Create the queue and spawn `workers` worker tasks (at least one).
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(resolver: Arc<dyn FunctionResolver>, workers: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver: SharedReceiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let jobs = Arc::new(JobTable::default());

        let handles = (0..workers.max(1))
            .map(|worker| tokio::spawn(run_worker(worker, receiver.clone(), jobs.clone())))
            .collect();

        Self {
            resolver,
            jobs,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
        }
    }

    /// Stop accepting jobs, let the workers drain what is already queued, and wait
    /// for them to exit.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut sender| sender.take());
        drop(sender);

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Queue worker ended abnormally");
            }
        }
        info!("Queue executor stopped");
    }
}

async fn run_worker(worker: usize, receiver: SharedReceiver, jobs: Arc<JobTable>) {
    debug!(worker, "Queue worker started");

    loop {
        let job = receiver.lock().await.recv().await;
        let Some(Job {
            job_id,
            function,
            args,
            kwargs,
        }) = job
        else {
            break;
        };

        jobs.set(&job_id, JobStatus::started());

        let outcome = tokio::task::spawn_blocking(move || function.call(&args, &kwargs)).await;
        let status = match outcome {
            Ok(outcome) => JobStatus::from_outcome(outcome),
            Err(e) => JobStatus::failed(format!("function panicked: {}", e)),
        };
        debug!(worker, job_id = %job_id, state = ?status.state, "Queue job done");
        jobs.set(&job_id, status);
    }

    debug!(worker, "Queue worker stopped");
}

#[async_trait]
impl Executor for QueueExecutor {
    fn executor_type(&self) -> &'static str {
        "queue"
    }

    async fn submit_call(
        &self,
        function_name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, ExecutorError> {
        let function = self.resolver.resolve(function_name)?;
        let job_id = Uuid::new_v4().to_string();

        self.jobs.set(&job_id, JobStatus::queued());

        let job = Job {
            job_id: job_id.clone(),
            function,
            args: args.to_vec(),
            kwargs: kwargs.clone(),
        };
        let sent = match self.sender.lock() {
            Ok(sender) => sender.as_ref().map(|sender| sender.send(job).is_ok()),
            Err(_) => None,
        };
        if sent != Some(true) {
            self.jobs.remove(&job_id);
            return Err(ExecutorError::ShutDown);
        }

        Ok(job_id)
    }

    async fn check_job(&self, job_id: &str) -> Result<JobStatus, ExecutorError> {
        self.jobs.get(job_id)
    }

    fn release_job(&self, job_id: &str) {
        self.jobs.remove(job_id);
    }

    fn get_stats(&self) -> ExecutorStats {
        let counts = self.jobs.counts();
        [
            ("queued", JobState::Queued),
            ("started", JobState::Started),
            ("finished", JobState::Finished),
            ("failed", JobState::Failed),
        ]
        .into_iter()
        .map(|(name, state)| (name.to_string(), counts.get(&state).copied().unwrap_or(0)))
        .chain([("jobs".to_string(), self.jobs.len() as u64)])
        .collect()
    }
}
