//! SQLite table definitions for the metadata index.

/// One row per file: 16-byte id and its unique slug
pub const FILES: &str = "files";

/// One row per metadata value; value order within a name follows rowid
pub const FILE_METADATA: &str = "file_metadata";

/// Single-row table recording the applied schema version
pub const DB_VERSION: &str = "fileshelf_db_version";

// Migration 1: base tables
pub(crate) const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS files (
    id   BLOB PRIMARY KEY NOT NULL,
    slug TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS file_metadata (
    file_id BLOB NOT NULL REFERENCES files(id),
    name    TEXT NOT NULL,
    value   TEXT NOT NULL
);
";

// Migration 2: lookup indexes for filters and hydration
pub(crate) const CREATE_INDEXES: &str = r"
CREATE INDEX IF NOT EXISTS idx_file_metadata_name_value ON file_metadata (name, value);
CREATE INDEX IF NOT EXISTS idx_file_metadata_file_id ON file_metadata (file_id);
";
