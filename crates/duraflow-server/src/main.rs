// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duraflow Server
//!
//! Runs the orchestrator driver loop and serves the HTTP API until Ctrl-C.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use duraflow_core::api;
use duraflow_core::executor::{Executor, LocalExecutor, QueueExecutor};
use duraflow_core::persistence::SqlitePersistence;
use duraflow_core::runtime::Runtime;
use duraflow_script::ScriptEngine;
use duraflow_server::builtins;
use duraflow_server::config::{Config, ExecutorKind};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duraflow=info".parse()?),
        )
        .init();

    info!("Starting Duraflow Server");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        database = %config.database_path.display(),
        http_addr = %config.http_addr,
        executor = ?config.executor,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Configuration loaded"
    );

    // Open database and run migrations
    let persistence = Arc::new(SqlitePersistence::from_path(&config.database_path).await?);
    info!("Database ready");

    let registry = Arc::new(builtins::registry()?);
    info!(functions = ?registry.names(), "Built-in functions registered");

    let queue = match config.executor {
        ExecutorKind::Queue => Some(Arc::new(QueueExecutor::new(
            registry.clone(),
            config.queue_workers,
        ))),
        ExecutorKind::Local => None,
    };
    let executor: Arc<dyn Executor> = match &queue {
        Some(queue) => queue.clone() as Arc<dyn Executor>,
        None => Arc::new(LocalExecutor::new(registry.clone())),
    };

    let runtime = Runtime::builder()
        .persistence(persistence.clone())
        .engine(Arc::new(ScriptEngine::new()))
        .resolver(registry)
        .executor(executor)
        .worker_config(config.worker_config())
        .build()?
        .start();

    // Serve HTTP API
    let app = api::router(runtime.orchestrator().clone());
    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    info!(addr = %config.http_addr, "HTTP API listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    });
    if let Err(e) = server.await {
        error!("HTTP server error: {}", e);
    }
    info!("Shutting down...");

    runtime.shutdown().await?;
    if let Some(queue) = queue {
        queue.shutdown().await;
    }
    persistence.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
