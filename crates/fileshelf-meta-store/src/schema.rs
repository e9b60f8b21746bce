//! Versioned schema migrations
//!
//! Migrations are applied in order, each inside its own transaction together
//! with the version bump, so re-running the runner is a no-op.

use crate::sql_error;
use crate::tables;
use fileshelf_common::{Error, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};

/// A single schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All known migrations, ordered by version
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create files and file_metadata",
        sql: tables::CREATE_TABLES,
    },
    Migration {
        version: 2,
        description: "index file_metadata lookups",
        sql: tables::CREATE_INDEXES,
    },
];

/// Schema version this build expects
pub const LATEST_VERSION: u32 = 2;

fn ensure_version_table(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS fileshelf_db_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| sql_error("create version table", e))?;
    Ok(())
}

/// Applied schema version (0 for a fresh database)
pub fn current_version(conn: &Connection) -> Result<u32> {
    ensure_version_table(conn)?;
    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM fileshelf_db_version",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()
        .map_err(|e| sql_error("read schema version", e))?
        .flatten();
    Ok(version.and_then(|v| u32::try_from(v).ok()).unwrap_or(0))
}

/// Bring the schema to [`LATEST_VERSION`]
pub fn migrate(conn: &mut Connection) -> Result<u32> {
    migrate_to(conn, LATEST_VERSION)
}

/// Bring the schema up to `target`
///
/// Never downgrades: a database already past `target` is left alone.
pub fn migrate_to(conn: &mut Connection, target: u32) -> Result<u32> {
    if target > LATEST_VERSION {
        return Err(Error::Configuration(format!(
            "schema version {target} is newer than supported version {LATEST_VERSION}"
        )));
    }

    let mut version = current_version(conn)?;
    if version >= target {
        debug!(version, target, "schema is up to date");
        return Ok(version);
    }

    let from = version;
    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > from && m.version <= target)
    {
        info!(
            version = migration.version,
            description = migration.description,
            "applying schema migration"
        );
        let tx = conn
            .transaction()
            .map_err(|e| sql_error("begin migration", e))?;
        tx.execute_batch(migration.sql)
            .map_err(|e| sql_error("apply migration", e))?;
        tx.execute(&format!("DELETE FROM {}", tables::DB_VERSION), [])
            .map_err(|e| sql_error("clear schema version", e))?;
        tx.execute(
            &format!("INSERT INTO {} (version) VALUES (?1)", tables::DB_VERSION),
            [i64::from(migration.version)],
        )
        .map_err(|e| sql_error("record schema version", e))?;
        tx.commit()
            .map_err(|e| sql_error("commit migration", e))?;
        version = migration.version;
    }

    Ok(version)
}
