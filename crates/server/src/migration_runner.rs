//! Lightweight migration runner for rusqlite.
//!
//! Migrations are numbered SQL files embedded at compile time, tracked in
//! `schema_versions`, and applied in order at startup.

use std::collections::HashSet;

use rusqlite::{params, Connection};
use tracing::{info, warn};

const MIGRATIONS: &[(i64, &str, &str)] = &[(
    1,
    "001_initial",
    include_str!("../migrations/001_initial.sql"),
)];

/// Run all pending migrations against the given connection.
///
/// Call this at startup before any other database operations.
pub fn run_migrations(conn: &mut Connection) -> anyhow::Result<()> {
    // Set pragmas for safe concurrent access
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    // Ensure tracking table exists
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
    )?;

    // Get already-applied versions
    let applied: HashSet<i64> = conn
        .prepare("SELECT version FROM schema_versions")?
        .query_map([], |row| row.get(0))?
        .filter_map(|r| r.ok())
        .collect();

    let mut pending = 0;
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }

        if let Err(e) = conn.execute_batch(sql) {
            warn!(
                component = "migrations",
                event = "migration.failed",
                version = version,
                name = %name,
                error = %e,
                "Migration failed (may already be applied)"
            );
            // Record it anyway - the schema likely already exists from
            // CREATE TABLE IF NOT EXISTS workarounds or manual application.
            conn.execute(
                "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
                params![version, name],
            )?;
            continue;
        }

        conn.execute(
            "INSERT OR IGNORE INTO schema_versions (version, name) VALUES (?1, ?2)",
            params![version, name],
        )?;

        info!(
            component = "migrations",
            event = "migration.applied",
            version = version,
            name = %name,
            "Applied migration"
        );
        pending += 1;
    }

    let total = MIGRATIONS.len();
    info!(
        component = "migrations",
        event = "migrations.complete",
        total = total,
        applied = pending,
        skipped = total - pending,
        "Migration check complete"
    );

    Ok(())
}
