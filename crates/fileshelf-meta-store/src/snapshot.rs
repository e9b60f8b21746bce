//! Point-in-time copy of the metadata index
//!
//! Snapshots are table-level: file rows and metadata rows, never blob
//! bytes. They travel over the sync channel bincode-encoded.

use fileshelf_common::{Error, FileId, Result};
use serde::{Deserialize, Serialize};

/// A `files` row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub id: FileId,
    pub slug: String,
}

/// A `file_metadata` row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadataRow {
    pub file_id: FileId,
    pub name: String,
    pub value: String,
}

/// Full dump of the index at one schema version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
    /// Metadata rows in insertion order
    pub metadata: Vec<SnapshotMetadataRow>,
}

impl IndexSnapshot {
    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| Error::Serialization(e.to_string()))
    }

    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}
