//! Schema creation and in-place upgrades.
//!
//! `PRAGMA user_version` records the last applied schema version. Every
//! startup runs [`init_schema`] inside an IMMEDIATE transaction, so processes
//! starting together take turns and whoever comes second sees the upgrade
//! already applied.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};

use crate::config::CONFIG_DEFAULTS;

/// Version 1: branch-only allocations. Version 2: adds `project`.
/// Version 3: uniqueness on (project, branch) only.
pub(crate) const SCHEMA_VERSION: i64 = 3;

const ALLOCATIONS_COLUMNS: &str = r#"(
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project TEXT NOT NULL DEFAULT '',
    branch TEXT NOT NULL,
    slot INTEGER NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    allocated_at INTEGER NOT NULL,   -- unix millis
    last_seen_at INTEGER NOT NULL    -- unix millis
)"#;

const CREATE_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const CREATE_INDEXES: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_allocations_consumer ON allocations(project, branch);
CREATE INDEX IF NOT EXISTS idx_allocations_slot ON allocations(slot);
CREATE INDEX IF NOT EXISTS idx_allocations_last_seen ON allocations(last_seen_at);
"#;

pub(crate) fn init_schema(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS allocations {ALLOCATIONS_COLUMNS};"
    ))?;
    tx.execute_batch(CREATE_CONFIG)?;

    let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        upgrade(&tx, version)?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    } else if version > SCHEMA_VERSION {
        tracing::warn!(
            version,
            supported = SCHEMA_VERSION,
            "Registry schema is newer than this build"
        );
    }

    tx.execute_batch(CREATE_INDEXES)?;

    for (key, value) in CONFIG_DEFAULTS {
        tx.execute(
            "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }

    tx.commit()
}

/// Patch older table shapes forward. Each step probes before it changes anything.
fn upgrade(conn: &Connection, from_version: i64) -> rusqlite::Result<()> {
    if !has_column(conn, "allocations", "project")? {
        tracing::info!(from_version, "Adding project column to allocations table");
        conn.execute_batch("ALTER TABLE allocations ADD COLUMN project TEXT NOT NULL DEFAULT ''")?;
    }
    if has_unique_index_on(conn, "allocations", &["branch"])? {
        tracing::info!(from_version, "Dropping branch-only uniqueness from allocations table");
        rebuild_allocations(conn)?;
    }
    Ok(())
}

/// Recreate `allocations` in the current shape, keeping rows, ids and the
/// AUTOINCREMENT high-water mark. Indexes are recreated by the caller.
fn rebuild_allocations(conn: &Connection) -> rusqlite::Result<()> {
    let high_water: Option<i64> = conn
        .query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = 'allocations'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS allocations_rebuild;
         CREATE TABLE allocations_rebuild {ALLOCATIONS_COLUMNS};
         INSERT INTO allocations_rebuild
             (id, project, branch, slot, display_name, allocated_at, last_seen_at)
         SELECT id, project, branch, slot, display_name, allocated_at, last_seen_at
         FROM allocations;
         DROP TABLE allocations;
         ALTER TABLE allocations_rebuild RENAME TO allocations;"
    ))?;

    if let Some(seq) = high_water {
        let updated = conn.execute(
            "UPDATE sqlite_sequence SET seq = MAX(seq, ?1) WHERE name = 'allocations'",
            params![seq],
        )?;
        if updated == 0 {
            conn.execute(
                "INSERT INTO sqlite_sequence (name, seq) VALUES ('allocations', ?1)",
                params![seq],
            )?;
        }
    }
    Ok(())
}

/// Whether `table` has a unique index (or UNIQUE constraint) over exactly `columns`.
pub(crate) fn has_unique_index_on(
    conn: &Connection,
    table: &str,
    columns: &[&str],
) -> rusqlite::Result<bool> {
    let mut list = conn.prepare(&format!("PRAGMA index_list({table})"))?;
    let unique_indexes: Vec<String> = list
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, bool>(2)?)))?
        .filter_map(|entry| match entry {
            Ok((name, true)) => Some(Ok(name)),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
        .collect::<rusqlite::Result<_>>()?;

    for index in unique_indexes {
        let mut info = conn.prepare(&format!("PRAGMA index_info(\"{index}\")"))?;
        let indexed: Vec<String> = info
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<rusqlite::Result<_>>()?;
        if indexed.iter().map(String::as_str).eq(columns.iter().copied()) {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Table shape written by releases that keyed allocations by branch alone.
#[cfg(test)]
pub(crate) const LEGACY_SCHEMA: &str = r#"
CREATE TABLE allocations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    branch TEXT NOT NULL UNIQUE,
    slot INTEGER NOT NULL UNIQUE,
    display_name TEXT NOT NULL,
    allocated_at INTEGER NOT NULL,
    last_seen_at INTEGER NOT NULL
);
CREATE TABLE config (key TEXT PRIMARY KEY, value TEXT NOT NULL);
INSERT INTO config (key, value) VALUES ('range_start', '20');
INSERT INTO allocations (branch, slot, display_name, allocated_at, last_seen_at)
    VALUES ('main', 20, 'main', 1000, 2000);
"#;
