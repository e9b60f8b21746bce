//! Metadata index backed by SQLite.
//!
//! All writes arrive through the write coordinator's apply path; each one
//! runs in a single transaction. Reads compile [`Criteria`] and hydrate the
//! resulting records with a second query.

use crate::query::{self, CompiledQuery, Criteria};
use crate::schema;
use crate::snapshot::{IndexSnapshot, SnapshotFile, SnapshotMetadataRow};
use crate::sql_error;
use fileshelf_common::{
    Error, FileId, FileRecord, FileRef, Metadata, Result, validate_slug,
};
use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params, params_from_iter};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

/// Local metadata index
pub struct MetaIndex {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for MetaIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaIndex").finish_non_exhaustive()
    }
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn file_id(bytes: &[u8]) -> Result<FileId> {
    FileId::from_slice(bytes).map_err(|e| Error::database(format!("corrupt file id: {e}")))
}

impl MetaIndex {
    /// Open (or create) the database file at `path`
    ///
    /// The schema is not migrated here; the coordinator does that once it
    /// knows whether a snapshot has to be restored first.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening metadata index");

        let conn = Connection::open(path).map_err(|e| sql_error("open database", e))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| sql_error("set pragmas", e))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        debug!("opening in-memory metadata index");
        let conn = Connection::open_in_memory().map_err(|e| sql_error("open database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .map_err(|e| sql_error("set pragmas", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Applied schema version
    pub fn schema_version(&self) -> Result<u32> {
        schema::current_version(&self.conn.lock())
    }

    /// Run all pending migrations
    pub fn migrate(&self) -> Result<u32> {
        schema::migrate(&mut self.conn.lock())
    }

    /// Run migrations up to `version`
    pub fn migrate_to(&self, version: u32) -> Result<u32> {
        schema::migrate_to(&mut self.conn.lock(), version)
    }

    /// Apply a replicated save: upsert the file row and replace its metadata
    pub fn apply_save(&self, id: FileId, slug: &str, metadata: &Metadata) -> Result<()> {
        validate_slug(slug)?;
        let id_bytes = &id.as_bytes()[..];

        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| sql_error("begin save", e))?;

        let owner: Option<Vec<u8>> = tx
            .query_row("SELECT id FROM files WHERE slug = ?1", [slug], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| sql_error("look up slug owner", e))?;
        if owner.is_some_and(|owner| owner != id_bytes) {
            return Err(Error::SlugTaken(slug.to_string()));
        }

        tx.execute(
            "INSERT INTO files (id, slug) VALUES (?1, ?2) \
             ON CONFLICT(id) DO UPDATE SET slug = excluded.slug",
            params![id_bytes, slug],
        )
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::SlugTaken(slug.to_string())
            } else {
                sql_error("upsert file", e)
            }
        })?;

        tx.execute("DELETE FROM file_metadata WHERE file_id = ?1", [id_bytes])
            .map_err(|e| sql_error("clear metadata", e))?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO file_metadata (file_id, name, value) VALUES (?1, ?2, ?3)",
                )
                .map_err(|e| sql_error("prepare metadata insert", e))?;
            for (name, value) in metadata.pairs() {
                stmt.execute(params![id_bytes, name, value])
                    .map_err(|e| sql_error("insert metadata", e))?;
            }
        }

        tx.commit().map_err(|e| sql_error("commit save", e))?;
        debug!(file_id = %id, slug, "applied save");
        Ok(())
    }

    /// Apply a replicated remove; returns whether the file existed
    pub fn apply_remove(&self, id: FileId) -> Result<bool> {
        let id_bytes = &id.as_bytes()[..];
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(|e| sql_error("begin remove", e))?;
        tx.execute("DELETE FROM file_metadata WHERE file_id = ?1", [id_bytes])
            .map_err(|e| sql_error("delete metadata", e))?;
        let removed = tx
            .execute("DELETE FROM files WHERE id = ?1", [id_bytes])
            .map_err(|e| sql_error("delete file", e))?;
        tx.commit().map_err(|e| sql_error("commit remove", e))?;
        debug!(file_id = %id, existed = removed > 0, "applied remove");
        Ok(removed > 0)
    }

    /// Id currently owning `slug`
    pub fn slug_owner(&self, slug: &str) -> Result<Option<FileId>> {
        let conn = self.conn.lock();
        let owner: Option<Vec<u8>> = conn
            .query_row("SELECT id FROM files WHERE slug = ?1", [slug], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| sql_error("look up slug owner", e))?;
        owner.as_deref().map(file_id).transpose()
    }

    /// A single record by id or slug, without bytes
    pub fn get(&self, file: &FileRef) -> Result<Option<FileRecord>> {
        let criteria = match file {
            FileRef::Id(id) => Criteria::ids([*id]),
            FileRef::Slug(slug) => Criteria::slugs([slug.as_str()]),
        };
        Ok(self.find(&criteria)?.into_iter().next())
    }

    /// Records matching `criteria`, in query order, without bytes
    pub fn find(&self, criteria: &Criteria) -> Result<Vec<FileRecord>> {
        let Some(compiled) = query::compile(criteria)? else {
            return Ok(Vec::new());
        };

        let conn = self.conn.lock();
        let rows = Self::select_files(&conn, &compiled)?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<FileId> = rows.iter().map(|(id, _)| *id).collect();
        let mut metadata = Self::select_metadata(&conn, &ids)?;
        drop(conn);

        Ok(rows
            .into_iter()
            .map(|(id, slug)| {
                let metadata = metadata.remove(&id).unwrap_or_default();
                FileRecord::new(id, slug, metadata)
            })
            .collect())
    }

    fn select_files(conn: &Connection, q: &CompiledQuery) -> Result<Vec<(FileId, String)>> {
        let mut stmt = conn
            .prepare(&q.sql)
            .map_err(|e| sql_error("prepare file query", e))?;
        let raw = stmt
            .query_map(params_from_iter(q.params.iter()), |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| sql_error("run file query", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| sql_error("read file rows", e))?;
        raw.into_iter()
            .map(|(id, slug)| Ok((file_id(&id)?, slug)))
            .collect()
    }

    fn select_metadata(conn: &Connection, ids: &[FileId]) -> Result<HashMap<FileId, Metadata>> {
        let q = query::hydration_query(ids);
        let mut stmt = conn
            .prepare(&q.sql)
            .map_err(|e| sql_error("prepare metadata query", e))?;
        let rows = stmt
            .query_map(params_from_iter(q.params.iter()), |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .map_err(|e| sql_error("run metadata query", e))?;

        let mut grouped: HashMap<FileId, Metadata> = HashMap::with_capacity(ids.len());
        for row in rows {
            let (id, name, value) = row.map_err(|e| sql_error("read metadata rows", e))?;
            grouped.entry(file_id(&id)?).or_default().insert(name, value);
        }
        Ok(grouped)
    }

    /// Number of files in the index
    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))
            .map_err(|e| sql_error("count files", e))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Consistent dump of both tables, taken inside one read transaction
    pub fn snapshot(&self) -> Result<IndexSnapshot> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction()
            .map_err(|e| sql_error("begin snapshot", e))?;
        let schema_version = schema::current_version(&tx)?;

        let files = {
            let mut stmt = tx
                .prepare("SELECT id, slug FROM files ORDER BY rowid")
                .map_err(|e| sql_error("prepare snapshot", e))?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| sql_error("snapshot files", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| sql_error("snapshot files", e))?;
            raw.into_iter()
                .map(|(id, slug)| Ok(SnapshotFile { id: file_id(&id)?, slug }))
                .collect::<Result<Vec<_>>>()?
        };

        let metadata = {
            let mut stmt = tx
                .prepare("SELECT file_id, name, value FROM file_metadata ORDER BY rowid")
                .map_err(|e| sql_error("prepare snapshot", e))?;
            let raw = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|e| sql_error("snapshot metadata", e))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| sql_error("snapshot metadata", e))?;
            raw.into_iter()
                .map(|(id, name, value)| {
                    Ok(SnapshotMetadataRow {
                        file_id: file_id(&id)?,
                        name,
                        value,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        tx.commit().map_err(|e| sql_error("end snapshot", e))?;
        debug!(
            files = files.len(),
            metadata_rows = metadata.len(),
            schema_version,
            "snapshot taken"
        );
        Ok(IndexSnapshot {
            schema_version,
            files,
            metadata,
        })
    }

    /// Replace the whole index with `snapshot`
    ///
    /// The schema is first brought to the snapshot's version so the rows fit.
    pub fn restore(&self, snapshot: &IndexSnapshot) -> Result<()> {
        let mut conn = self.conn.lock();
        // A version 0 snapshot still needs the base tables
        schema::migrate_to(&mut conn, snapshot.schema_version.max(1))?;

        let tx = conn
            .transaction()
            .map_err(|e| sql_error("begin restore", e))?;
        tx.execute("DELETE FROM file_metadata", [])
            .map_err(|e| sql_error("clear metadata", e))?;
        tx.execute("DELETE FROM files", [])
            .map_err(|e| sql_error("clear files", e))?;
        {
            let mut stmt = tx
                .prepare("INSERT INTO files (id, slug) VALUES (?1, ?2)")
                .map_err(|e| sql_error("prepare restore", e))?;
            for file in &snapshot.files {
                stmt.execute(params![&file.id.as_bytes()[..], file.slug])
                    .map_err(|e| sql_error("restore file", e))?;
            }
            let mut stmt = tx
                .prepare("INSERT INTO file_metadata (file_id, name, value) VALUES (?1, ?2, ?3)")
                .map_err(|e| sql_error("prepare restore", e))?;
            for row in &snapshot.metadata {
                stmt.execute(params![&row.file_id.as_bytes()[..], row.name, row.value])
                    .map_err(|e| sql_error("restore metadata", e))?;
            }
        }
        tx.commit().map_err(|e| sql_error("commit restore", e))?;

        info!(
            files = snapshot.files.len(),
            metadata_rows = snapshot.metadata.len(),
            schema_version = snapshot.schema_version,
            "restored index from snapshot"
        );
        Ok(())
    }
}
