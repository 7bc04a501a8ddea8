// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for duraflow-core.
//!
//! This module exposes the embedded schema migrations so that products embedding
//! duraflow-core with their own pool can set up the `executions` and `calls` tables.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::SqlitePool;
//! use duraflow_core::migrations;
//!
//! let pool = SqlitePool::connect("sqlite:.data/duraflow.db?mode=rwc").await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with all core migrations embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Applies all pending migrations to the database. Safe to call multiple times;
/// already-applied migrations are skipped.
pub async fn run(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
