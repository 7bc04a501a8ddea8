// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duraflow Core - Durable Execution Orchestrator
//!
//! This crate drives long-running workflow programs that call external functions.
//! A program runs inside a continuation engine until it blocks on calls; the
//! orchestrator snapshots it, records the calls as one *resume group*, dispatches
//! them to a function executor, and resumes the program once every call of the
//! group has completed. All state lives in SQLite, so executions survive restarts
//! and any number of orchestrators may share one database.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   start_execution / poll   ┌─────────────────────────┐
//! │  HTTP API / embedder │ ─────────────────────────► │      Orchestrator       │
//! └──────────────────────┘                            │  (resume groups, guards)│
//!            │ webhook                                └─────────────────────────┘
//!            ▼                                             │              │
//! ┌──────────────────────┐  submit / check_job  ┌──────────┴───┐   ┌──────┴───────────┐
//! │   Function Executor  │ ◄─────────────────── │ Driver Loop  │   │ Continuation     │
//! │ local / queue / push │                      │ (Worker)     │   │ Engine           │
//! └──────────────────────┘                      └──────────────┘   └──────────────────┘
//!                                                      │
//!                                                      ▼
//!                                              ┌──────────────┐
//!                                              │    SQLite    │
//!                                              └──────────────┘
//! ```
//!
//! # Execution lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | `scheduled` | Submitted, the program has not run yet |
//! | `waiting` | Suspended on the calls of its current resume group |
//! | `completed` | Finished with an output |
//! | `failed` | A call failed or the program itself is broken |
//!
//! Every transition is a guarded write against the status and resume group the
//! writer read. A writer that loses the race writes nothing.
//!
//! # Embedding
//!
//! See [`runtime::Runtime`] for running the driver loop inside an existing tokio
//! application, and [`api::router`] (feature `http`) for the HTTP surface.

#![deny(missing_docs)]

/// HTTP API: submission, polling, webhook completions and health.
#[cfg(feature = "http")]
pub mod api;

/// Continuation engine contract: start, advance, dump and load programs.
pub mod engine;

/// Error types with stable machine-readable codes.
pub mod error;

/// Function executors: local, in-process queue and push.
pub mod executor;

/// External functions, the function registry and name resolution.
pub mod functions;

/// Embedded database migrations.
pub mod migrations;

/// Execution coordinator: lifecycle, resume groups and call outcomes.
pub mod orchestrator;

/// Execution and call records, the persistence trait and its SQLite backend.
pub mod persistence;

/// Embeddable runtime running the driver loop as a tokio task.
pub mod runtime;

/// Driver loop dispatching calls and advancing executions.
pub mod worker;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use runtime::{Runtime, RuntimeBuilder};
pub use worker::{Worker, WorkerConfig};
