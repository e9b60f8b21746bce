//! Replicated write commands
//!
//! Wire form (JSON):
//!
//! ```json
//! {"action": "save", "payload": {"id": "...", "slug": "a.txt", "metadata": {"tag": ["x"]}}, "correlation_id": "..."}
//! {"action": "remove", "payload": {"id": "..."}, "correlation_id": "..."}
//! ```

use bytes::Bytes;
use fileshelf_common::{FileId, Metadata, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Payload of a `save` command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavePayload {
    pub id: FileId,
    pub slug: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Blob bytes, only carried when blob replication is enabled
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub data: Option<Bytes>,
}

/// Payload of a `remove` command
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovePayload {
    pub id: FileId,
}

/// A single replicated mutation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "lowercase")]
pub enum Command {
    Save(SavePayload),
    Remove(RemovePayload),
}

impl Command {
    /// Save without bytes
    #[must_use]
    pub fn save(id: FileId, slug: impl Into<String>, metadata: Metadata) -> Self {
        Self::Save(SavePayload {
            id,
            slug: slug.into(),
            metadata,
            data: None,
        })
    }

    #[must_use]
    pub const fn remove(id: FileId) -> Self {
        Self::Remove(RemovePayload { id })
    }

    /// File the command targets
    #[must_use]
    pub const fn file_id(&self) -> FileId {
        match self {
            Self::Save(p) => p.id,
            Self::Remove(p) => p.id,
        }
    }

    #[must_use]
    pub const fn action(&self) -> &'static str {
        match self {
            Self::Save(_) => "save",
            Self::Remove(_) => "remove",
        }
    }
}

/// A command tagged with the id its originator waits on
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub command: Command,
    pub correlation_id: Uuid,
}

impl Envelope {
    #[must_use]
    pub const fn new(command: Command, correlation_id: Uuid) -> Self {
        Self {
            command,
            correlation_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(data: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| {
                STANDARD
                    .decode(s)
                    .map(Bytes::from)
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
    }
}
