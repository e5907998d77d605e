// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embedded schema migrations for the SQLite history log.
//!
//! [`SqliteHistory::connect`](crate::history::SqliteHistory::connect) applies
//! them automatically. Callers that build their own pool use [`run_sqlite`].
//!
//! ```ignore
//! let pool = SqlitePool::connect("sqlite:.data/tideway.db?mode=rwc").await?;
//! tideway_core::migrations::run_sqlite(&pool).await?;
//! let store = SqliteHistory::new(pool);
//! ```

use sqlx::migrate::MigrateError;

/// SQLite migrator with the history schema embedded.
pub static SQLITE: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// Run SQLite migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run_sqlite(pool: &sqlx::SqlitePool) -> Result<(), MigrateError> {
    SQLITE.run(pool).await
}
