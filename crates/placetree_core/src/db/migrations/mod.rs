//! Numbered schema scripts and the runner that applies them.
//!
//! # Invariants
//! - Versions start at 1 and increase by one per script.
//! - `PRAGMA user_version` always names the last script applied.
//! - A database newer than this binary is never touched.

use crate::db::{DbError, DbResult};
use log::info;
use rusqlite::Connection;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "places",
        sql: include_str!("0001_places.sql"),
    },
    Migration {
        version: 2,
        name: "classification",
        sql: include_str!("0002_classification.sql"),
    },
];

/// Returns the schema version this binary migrates to.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |migration| migration.version)
}

/// Brings the schema of `conn` up to [`latest_version`].
///
/// Returns the number of scripts applied. All pending scripts share one
/// transaction, so a failing script leaves the previous version in place.
pub fn apply_migrations(conn: &mut Connection) -> DbResult<usize> {
    let from_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    let to_version = latest_version();
    if from_version > to_version {
        return Err(DbError::UnsupportedSchemaVersion {
            db_version: from_version,
            latest_supported: to_version,
        });
    }

    let pending = pending_after(from_version);
    if pending.is_empty() {
        return Ok(0);
    }

    let started_at = Instant::now();
    let tx = conn.transaction()?;
    for migration in pending {
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
    }
    tx.commit()?;

    info!(
        "event=db_migrate module=db status=ok from_version={} to_version={} scripts={} names={} duration_ms={}",
        from_version,
        to_version,
        pending.len(),
        pending
            .iter()
            .map(|migration| migration.name)
            .collect::<Vec<_>>()
            .join(","),
        started_at.elapsed().as_millis()
    );
    Ok(pending.len())
}

fn pending_after(version: u32) -> &'static [Migration] {
    let applied = MIGRATIONS
        .iter()
        .take_while(|migration| migration.version <= version)
        .count();
    &MIGRATIONS[applied..]
}
