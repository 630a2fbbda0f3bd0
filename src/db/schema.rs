//! Versioned schema migrations, embedded at compile time.
//!
//! Applied versions are recorded in `schema_migrations`. A migration's SQL and
//! its bookkeeping row commit in the same transaction, so an interrupted start
//! leaves the database at the previous version.

use std::collections::HashSet;

use anyhow::{Context, Result};
use rusqlite::Connection;

const MIGRATIONS: &[(u32, &str, &str)] = &[
    (1, "initial", include_str!("migrations/001_initial.sql")),
    (2, "subject_index", include_str!("migrations/002_subject_index.sql")),
];

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .context("Failed to create schema_migrations table")?;

    let applied = applied_versions(conn)?;
    let pending: Vec<_> = MIGRATIONS
        .iter()
        .filter(|(version, _, _)| !applied.contains(version))
        .collect();

    if pending.is_empty() {
        tracing::debug!("Schema is up to date");
        return Ok(());
    }

    for &&(version, name, sql) in &pending {
        tracing::info!(version, name, "Applying migration");
        let tx = conn
            .unchecked_transaction()
            .context("Failed to start migration transaction")?;
        tx.execute_batch(sql)
            .with_context(|| format!("Migration {:03} ({}) failed", version, name))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
            (version, name, chrono::Utc::now().to_rfc3339()),
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn applied_versions(conn: &Connection) -> Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<u32>>>()?;
    Ok(versions)
}
