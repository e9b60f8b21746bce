//! Blob storage on the local filesystem
//!
//! Each file's bytes live in a flat file under the storage root, named by
//! the canonical hyphenated id. Writes go through a temp file in the same
//! directory followed by a rename.

use bytes::Bytes;
use fileshelf_common::{Error, FileId, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

/// Suffix used for in-flight writes; never a valid id
const TEMP_SUFFIX: &str = ".partial";

/// Local blob store rooted at a single directory
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    stats: BlobStats,
}

/// Blob store statistics
#[derive(Debug, Default)]
pub struct BlobStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub deletes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub missing: AtomicU64,
}

impl BlobStore {
    /// Open a blob store, creating the root directory if missing
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            error!(path = %root.display(), error = %e, "failed to create blob storage root");
            Error::Io(e)
        })?;
        debug!(path = %root.display(), "blob store opened");
        Ok(Self {
            root,
            stats: BlobStats::default(),
        })
    }

    /// Storage root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a blob lives at
    #[must_use]
    pub fn path_for(&self, id: FileId) -> PathBuf {
        self.root.join(id.to_string())
    }

    fn temp_path_for(&self, id: FileId) -> PathBuf {
        self.root.join(format!("{id}{TEMP_SUFFIX}"))
    }

    /// Write a blob, replacing any previous bytes
    pub async fn write(&self, id: FileId, data: &[u8]) -> Result<()> {
        let tmp = self.temp_path_for(id);
        let path = self.path_for(id);

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = result {
            error!(file_id = %id, path = %path.display(), error = %e, "blob write failed");
            // Leftover temp file is harmless but would accumulate
            let _ = fs::remove_file(&tmp).await;
            return Err(Error::Io(e));
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        debug!(file_id = %id, size = data.len(), "blob written");
        Ok(())
    }

    /// Read a blob
    ///
    /// A missing file means the index references bytes this node never
    /// stored; that is reported as [`Error::BlobMissing`].
    pub async fn read(&self, id: FileId) -> Result<Bytes> {
        let path = self.path_for(id);
        match fs::read(&path).await {
            Ok(data) => {
                self.stats.reads.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_read
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(Bytes::from(data))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.stats.missing.fetch_add(1, Ordering::Relaxed);
                warn!(
                    file_id = %id,
                    path = %path.display(),
                    "metadata present but blob is missing from local storage"
                );
                Err(Error::BlobMissing { id })
            }
            Err(e) => {
                error!(file_id = %id, path = %path.display(), error = %e, "blob read failed");
                Err(Error::Io(e))
            }
        }
    }

    /// Delete a blob; deleting a missing blob succeeds
    pub async fn delete(&self, id: FileId) -> Result<()> {
        let path = self.path_for(id);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                debug!(file_id = %id, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!(file_id = %id, path = %path.display(), error = %e, "blob delete failed");
                Err(Error::Io(e))
            }
        }
    }

    /// Whether a blob exists locally
    pub async fn exists(&self, id: FileId) -> Result<bool> {
        Ok(fs::try_exists(self.path_for(id)).await?)
    }

    /// Get statistics
    #[must_use]
    pub fn stats(&self) -> &BlobStats {
        &self.stats
    }
}
