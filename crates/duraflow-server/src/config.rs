// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use duraflow_core::WorkerConfig;

/// Which function executor the server dispatches calls to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// Run functions inline during submission.
    Local,
    /// Run functions on an in-process worker pool.
    Queue,
}

impl std::str::FromStr for ExecutorKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "queue" => Ok(Self::Queue),
            _ => Err(ConfigError::Invalid(
                "DURAFLOW_EXECUTOR",
                "must be 'local' or 'queue'",
            )),
        }
    }
}

/// Duraflow server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file
    pub database_path: PathBuf,
    /// HTTP API address
    pub http_addr: SocketAddr,
    /// Pause between driver loop ticks
    pub poll_interval: Duration,
    /// Pending calls dispatched per tick
    pub submit_batch_size: i64,
    /// Submitted calls checked per tick
    pub check_batch_size: i64,
    /// Function executor
    pub executor: ExecutorKind,
    /// Worker tasks of the queue executor
    pub queue_workers: usize,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DURAFLOW_DATABASE_PATH`: SQLite database file (default: .data/duraflow.db)
    /// - `DURAFLOW_HTTP_PORT`: HTTP API port (default: 8080)
    /// - `DURAFLOW_POLL_INTERVAL_MS`: Driver loop interval (default: 1000)
    /// - `DURAFLOW_SUBMIT_BATCH_SIZE`: Calls dispatched per tick (default: 10)
    /// - `DURAFLOW_CHECK_BATCH_SIZE`: Calls checked per tick (default: 50)
    /// - `DURAFLOW_EXECUTOR`: `local` or `queue` (default: queue)
    /// - `DURAFLOW_QUEUE_WORKERS`: Queue worker tasks (default: 4)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_path = std::env::var("DURAFLOW_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(".data/duraflow.db"));
        if database_path.as_os_str().is_empty() {
            return Err(ConfigError::Missing("DURAFLOW_DATABASE_PATH"));
        }

        let http_port: u16 = parse_var(
            "DURAFLOW_HTTP_PORT",
            "8080",
            "must be a valid port number",
        )?;

        let poll_interval_ms: u64 = parse_var(
            "DURAFLOW_POLL_INTERVAL_MS",
            "1000",
            "must be a non-negative integer",
        )?;

        let submit_batch_size: i64 = parse_var(
            "DURAFLOW_SUBMIT_BATCH_SIZE",
            "10",
            "must be a positive integer",
        )?;
        if submit_batch_size < 1 {
            return Err(ConfigError::Invalid(
                "DURAFLOW_SUBMIT_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let check_batch_size: i64 = parse_var(
            "DURAFLOW_CHECK_BATCH_SIZE",
            "50",
            "must be a positive integer",
        )?;
        if check_batch_size < 1 {
            return Err(ConfigError::Invalid(
                "DURAFLOW_CHECK_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let executor: ExecutorKind = std::env::var("DURAFLOW_EXECUTOR")
            .unwrap_or_else(|_| "queue".to_string())
            .parse()?;

        let queue_workers: usize = parse_var(
            "DURAFLOW_QUEUE_WORKERS",
            "4",
            "must be a positive integer",
        )?;
        if queue_workers == 0 {
            return Err(ConfigError::Invalid(
                "DURAFLOW_QUEUE_WORKERS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            database_path,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            poll_interval: Duration::from_millis(poll_interval_ms),
            submit_batch_size,
            check_batch_size,
            executor,
            queue_workers,
        })
    }

    /// Driver loop settings.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
            submit_batch_size: self.submit_batch_size,
            check_batch_size: self.check_batch_size,
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    key: &'static str,
    default: &str,
    reason: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .map_err(|_| ConfigError::Invalid(key, reason))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
