// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for duraflow-core.
//!
//! This module provides [`Runtime`] which runs the driver loop inside an existing
//! tokio application, next to an [`Orchestrator`] the application can submit
//! executions to.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use duraflow_core::executor::LocalExecutor;
//! use duraflow_core::functions::FunctionRegistry;
//! use duraflow_core::persistence::SqlitePersistence;
//! use duraflow_core::runtime::Runtime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = Arc::new(FunctionRegistry::new());
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/duraflow.db").await?);
//!
//!     let runtime = Runtime::builder()
//!         .persistence(persistence)
//!         .engine(Arc::new(duraflow_script::ScriptEngine::new()))
//!         .resolver(registry.clone())
//!         .executor(Arc::new(LocalExecutor::new(registry)))
//!         .build()?
//!         .start();
//!
//!     let id = runtime
//!         .orchestrator()
//!         .start_execution(code, ["add"], Default::default())
//!         .await?;
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::engine::ContinuationEngine;
use crate::executor::Executor;
use crate::functions::FunctionResolver;
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::worker::{Worker, WorkerConfig};

/// Builder for creating a [`Runtime`].
#[derive(Default)]
pub struct RuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    engine: Option<Arc<dyn ContinuationEngine>>,
    resolver: Option<Arc<dyn FunctionResolver>>,
    executor: Option<Arc<dyn Executor>>,
    worker_config: WorkerConfig,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("engine", &self.engine.as_ref().map(|_| "..."))
            .field("resolver", &self.resolver.as_ref().map(|_| "..."))
            .field(
                "executor",
                &self.executor.as_ref().map(|e| e.executor_type()),
            )
            .field("worker_config", &self.worker_config)
            .finish()
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the continuation engine (required).
    pub fn engine(mut self, engine: Arc<dyn ContinuationEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Set the resolver for unqualified function references (required).
    pub fn resolver(mut self, resolver: Arc<dyn FunctionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the function executor (required).
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Set the driver loop configuration.
    ///
    /// Default: 1s interval, submit batch 10, check batch 50.
    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("resolver is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| anyhow::anyhow!("executor is required"))?;

        Ok(RuntimeConfig {
            orchestrator: Arc::new(Orchestrator::new(persistence, engine, resolver)),
            executor,
            worker_config: self.worker_config,
        })
    }
}

/// Configuration for a [`Runtime`].
pub struct RuntimeConfig {
    orchestrator: Arc<Orchestrator>,
    executor: Arc<dyn Executor>,
    worker_config: WorkerConfig,
}

impl RuntimeConfig {
    /// The orchestrator the runtime will drive.
    ///
    /// Useful to wire a [`crate::executor::PushExecutor`] sink before starting.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Start the runtime, spawning the driver loop task.
    pub fn start(self) -> Runtime {
        let worker = Worker::new(
            self.orchestrator.clone(),
            self.executor.clone(),
            self.worker_config,
        );
        let shutdown = worker.shutdown_handle();
        let worker_handle = tokio::spawn(async move { worker.run().await });

        info!(executor = self.executor.executor_type(), "Runtime started");

        Runtime {
            orchestrator: self.orchestrator,
            executor: self.executor,
            shutdown,
            worker_handle,
        }
    }
}

/// A running orchestrator with its driver loop.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct Runtime {
    orchestrator: Arc<Orchestrator>,
    executor: Arc<dyn Executor>,
    shutdown: CancellationToken,
    worker_handle: JoinHandle<()>,
}

impl Runtime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The orchestrator, for submitting and polling executions.
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// The executor the driver loop dispatches to.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Check if the driver loop is still running.
    pub fn is_running(&self) -> bool {
        !self.worker_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Signals the driver loop to stop and waits for its current tick to finish.
    pub async fn shutdown(self) -> Result<()> {
        info!("Runtime shutting down...");
        self.shutdown.cancel();

        match self.worker_handle.await {
            Ok(()) => {
                info!("Runtime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("Driver loop task panicked: {}", e);
                Err(anyhow::anyhow!("driver loop task panicked: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{Map, json};

    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::executor::testing::registry;
    use crate::executor::{LocalExecutor, PushExecutor};
    use crate::orchestrator::PollStatus;
    use crate::persistence::SqlitePersistence;

    fn engine() -> Arc<MockEngine> {
        Arc::new(MockEngine::new(vec![vec![
            (0, "add", vec![json!(1), json!(2)]),
            (1, "add", vec![json!(3), json!(4)]),
        ]]))
    }

    fn fast() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_for_completion(runtime: &Runtime, id: &str) -> Option<serde_json::Value> {
        for _ in 0..300 {
            let report = runtime.orchestrator().poll(id).await.unwrap();
            if report.status != PollStatus::Pending {
                return report.output;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[test]
    fn test_build_requires_components() {
        let err = Runtime::builder().build().err().unwrap();
        assert!(err.to_string().contains("persistence"));
    }

    #[tokio::test]
    async fn test_runtime_drives_executions() {
        let registry = registry();
        let runtime = Runtime::builder()
            .persistence(Arc::new(SqlitePersistence::in_memory().await.unwrap()))
            .engine(engine())
            .resolver(registry.clone())
            .executor(Arc::new(LocalExecutor::new(registry)))
            .worker_config(fast())
            .build()
            .unwrap()
            .start();
        assert!(runtime.is_running());

        let id = runtime
            .orchestrator()
            .start_execution("program", ["add"], Map::new())
            .await
            .unwrap();

        assert_eq!(wait_for_completion(&runtime, &id).await, Some(json!(10)));
        runtime.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_runtime_with_push_executor() {
        let registry = registry();
        let config = Runtime::builder()
            .persistence(Arc::new(SqlitePersistence::in_memory().await.unwrap()))
            .engine(engine())
            .resolver(registry.clone())
            // Placeholder replaced below once the orchestrator exists
            .executor(Arc::new(LocalExecutor::new(registry.clone())))
            .worker_config(fast())
            .build()
            .unwrap();
        let push = Arc::new(PushExecutor::new(registry, config.orchestrator().clone()));
        let runtime = RuntimeConfig {
            executor: push,
            ..config
        }
        .start();
        assert_eq!(runtime.executor().executor_type(), "push");

        let id = runtime
            .orchestrator()
            .start_execution("program", ["add"], Map::new())
            .await
            .unwrap();

        assert_eq!(wait_for_completion(&runtime, &id).await, Some(json!(10)));
        runtime.shutdown().await.unwrap();
    }
}
