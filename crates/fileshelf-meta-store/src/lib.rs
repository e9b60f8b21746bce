//! fileshelf Metadata Store - SQLite metadata index
//!
//! This crate holds the relational index (`files` + `file_metadata`), its
//! migrations, the metadata query compiler and the snapshot format used to
//! bootstrap replicas.

pub mod index;
pub mod query;
pub mod schema;
pub mod snapshot;
pub mod tables;

use fileshelf_common::Error;
use tracing::error;

// Re-exports
pub use index::MetaIndex;
pub use query::{Criteria, Direction, Filter, Operator, Order, Predicate};
pub use snapshot::{IndexSnapshot, SnapshotFile, SnapshotMetadataRow};

/// Log a SQLite failure with context and convert it
pub(crate) fn sql_error(context: &str, e: rusqlite::Error) -> Error {
    error!(context, error = %e, "sqlite error");
    Error::database(format!("{context}: {e}"))
}
