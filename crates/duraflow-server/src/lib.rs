// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duraflow Server - standalone orchestrator process
//!
//! Wires the SQLite store, the step-program engine, a function executor and the
//! driver loop together and serves the HTTP API.
//!
//! # Configuration
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DURAFLOW_DATABASE_PATH` | `.data/duraflow.db` |
//! | `DURAFLOW_HTTP_PORT` | `8080` |
//! | `DURAFLOW_POLL_INTERVAL_MS` | `1000` |
//! | `DURAFLOW_SUBMIT_BATCH_SIZE` | `10` |
//! | `DURAFLOW_CHECK_BATCH_SIZE` | `50` |
//! | `DURAFLOW_EXECUTOR` | `queue` |
//! | `DURAFLOW_QUEUE_WORKERS` | `4` |

#![deny(missing_docs)]

/// Built-in function library.
pub mod builtins;

/// Server configuration loaded from environment variables.
pub mod config;
