//! File CRUD facade
//!
//! Reads go straight to the local index and blob store. Writes go through
//! the write coordinator, after which the blob is written locally (unless
//! blobs travel with the command) and the canonical record is read back.

use bytes::Bytes;
use fileshelf_bus::MessageBus;
use fileshelf_common::{
    Config, Error, FileId, FileRecord, FileRef, Metadata, Result, validate_slug,
};
use fileshelf_meta_store::{Criteria, MetaIndex};
use fileshelf_storage::BlobStore;
use fileshelf_writer::{Command, SavePayload, WriteCoordinator};
use std::sync::Arc;
use tracing::{debug, info};

/// Input to [`FileService::save`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SaveRequest {
    /// Existing file to update; a new id is minted when absent
    pub id: Option<FileId>,
    pub slug: String,
    pub metadata: Metadata,
    /// New bytes; `None` keeps an existing file's blob
    pub data: Option<Bytes>,
    /// Without an id, update the file that already owns `slug`
    pub update_matching_slug: bool,
}

impl SaveRequest {
    #[must_use]
    pub fn new(slug: impl Into<String>) -> Self {
        Self {
            slug: slug.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_id(mut self, id: FileId) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = Some(data.into());
        self
    }

    #[must_use]
    pub const fn update_matching_slug(mut self) -> Self {
        self.update_matching_slug = true;
        self
    }
}

impl From<FileRecord> for SaveRequest {
    fn from(record: FileRecord) -> Self {
        Self {
            id: Some(record.id),
            slug: record.slug,
            metadata: record.metadata,
            data: record.data,
            update_matching_slug: false,
        }
    }
}

/// Public file surface of a node
#[derive(Debug)]
pub struct FileService {
    index: Arc<MetaIndex>,
    blobs: Arc<BlobStore>,
    writer: WriteCoordinator,
    replicate_blobs: bool,
}

impl FileService {
    /// Open the on-disk index and blob store from `config`, attach to `bus`
    /// and wait until the node is ready
    pub async fn open(config: Config, bus: Arc<dyn MessageBus>) -> Result<Self> {
        let index = Arc::new(MetaIndex::open(&config.storage.database_path)?);
        let blobs = Arc::new(BlobStore::open(&config.storage.storage_path).await?);
        Self::from_parts(config, index, blobs, bus).await
    }

    /// Like [`FileService::open`] with an already opened index and blob store
    pub async fn from_parts(
        config: Config,
        index: Arc<MetaIndex>,
        blobs: Arc<BlobStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        let node = config.node.name.clone();
        let replicate_blobs = config.writer.replicate_blobs;
        let writer = WriteCoordinator::new(config, index.clone(), blobs.clone(), bus);
        writer.start().await?;
        if let Err(e) = writer.ready().await {
            writer.shutdown();
            return Err(e);
        }
        info!(%node, mode = %writer.mode(), replicate_blobs, "file service ready");

        Ok(Self {
            index,
            blobs,
            writer,
            replicate_blobs,
        })
    }

    #[must_use]
    pub const fn coordinator(&self) -> &WriteCoordinator {
        &self.writer
    }

    /// Stop the coordinator's background tasks
    ///
    /// Dropping the service does the same.
    pub fn close(&self) {
        self.writer.shutdown();
    }

    /// Fetch one file, with its bytes when `include_data` is set
    pub async fn get(&self, file: impl Into<FileRef>, include_data: bool) -> Result<FileRecord> {
        self.writer.ready().await?;
        let file = file.into();
        let mut record = self
            .index
            .get(&file)?
            .ok_or_else(|| Error::not_found(&file))?;
        if include_data {
            record.data = Some(self.blobs.read(record.id).await?);
        }
        Ok(record)
    }

    /// Files matching `criteria`, never with bytes
    pub async fn list(&self, criteria: &Criteria) -> Result<Vec<FileRecord>> {
        self.writer.ready().await?;
        self.index.find(criteria)
    }

    /// Id of the file owning `slug`
    pub async fn uuid_from_slug(&self, slug: &str) -> Result<Option<FileId>> {
        self.writer.ready().await?;
        self.index.slug_owner(slug)
    }

    /// Create or update a file and return the stored record
    ///
    /// The slug check here is advisory; the coordinator re-checks it when
    /// the command is applied and that result wins.
    pub async fn save(&self, request: SaveRequest) -> Result<FileRecord> {
        let SaveRequest {
            id,
            slug,
            metadata,
            data,
            update_matching_slug,
        } = request;
        validate_slug(&slug)?;
        self.writer.ready().await?;

        let owner = self.index.slug_owner(&slug)?;
        let id = match (id, owner) {
            (None, Some(owner)) if update_matching_slug => Some(owner),
            (None, Some(_)) => return Err(Error::SlugTaken(slug)),
            (Some(id), Some(owner)) if owner != id => return Err(Error::SlugTaken(slug)),
            (id, _) => id,
        };

        let is_new = match id {
            Some(id) => self.index.get(&FileRef::Id(id))?.is_none(),
            None => true,
        };
        let id = id.unwrap_or_else(FileId::new);
        let data = data.or_else(|| is_new.then(Bytes::new));

        let payload = SavePayload {
            id,
            slug,
            metadata,
            data: if self.replicate_blobs { data.clone() } else { None },
        };
        self.writer.commit(Command::Save(payload)).await?;

        if !self.replicate_blobs {
            if let Some(data) = &data {
                self.blobs.write(id, data).await?;
            }
        }
        debug!(file_id = %id, is_new, "file saved");

        self.get(id, true).await
    }

    /// Remove a file by id
    ///
    /// Removing an id that no longer exists succeeds.
    pub async fn rm(&self, id: &str) -> Result<()> {
        let id = FileId::parse(id)?;
        self.writer.commit(Command::remove(id)).await?;
        if !self.replicate_blobs {
            self.blobs.delete(id).await?;
        }
        debug!(file_id = %id, "file removed");
        Ok(())
    }
}

impl Drop for FileService {
    fn drop(&mut self) {
        self.writer.shutdown();
    }
}
