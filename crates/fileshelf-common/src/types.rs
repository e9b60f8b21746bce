//! Core type definitions for fileshelf
//!
//! This module defines the fundamental types shared by every component:
//! file identifiers, slugs, metadata maps and the file record itself.

use bytes::Bytes;
use derive_more::{From, Into};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a stored file
///
/// Persisted as 16 raw bytes in the index and displayed as the canonical
/// hyphenated hex string, which is also the blob file name on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from existing UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Create from the compact 16-byte form stored in the index
    pub fn from_slice(bytes: &[u8]) -> Result<Self, FileIdError> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| FileIdError::BadLength(bytes.len()))
    }

    /// Parse a file ID from its textual form
    ///
    /// Accepts any form the `uuid` crate understands (hyphenated, simple,
    /// braced, urn), so callers may pass ids copied from logs or URLs.
    pub fn parse(s: &str) -> Result<Self, FileIdError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FileIdError::Empty);
        }
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| FileIdError::Malformed(s.to_string()))
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Get as bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for FileId {
    type Err = FileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Errors that can occur when parsing a file ID
#[derive(Debug, Clone, thiserror::Error)]
pub enum FileIdError {
    #[error("file id cannot be empty")]
    Empty,
    #[error("malformed file id: {0:?}")]
    Malformed(String),
    #[error("file id must be 16 bytes, got {0}")]
    BadLength(usize),
}

/// Validate a slug before it is committed
///
/// Slugs are opaque, human readable names. The only structural rule is that
/// they are not empty; uniqueness is checked against the index.
pub fn validate_slug(slug: &str) -> Result<(), SlugError> {
    if slug.is_empty() {
        return Err(SlugError::Empty);
    }
    Ok(())
}

/// Errors that can occur when validating a slug
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlugError {
    #[error("slug cannot be empty")]
    Empty,
}

/// Searchable key/value metadata attached to a file
///
/// A name maps to an ordered list of values. Values keep their insertion
/// order so a record round-trips unchanged; names are kept sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, Vec<String>>);

impl Metadata {
    /// Create an empty metadata map
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Append a value under `name`
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.entry(name.into()).or_default().push(value.into());
    }

    /// Replace every value under `name`
    pub fn set<I, V>(&mut self, name: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        let name = name.into();
        if values.is_empty() {
            self.0.remove(&name);
        } else {
            self.0.insert(name, values);
        }
    }

    /// Builder-style variant of [`Metadata::insert`]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Values stored under `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// First value stored under `name`
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// Remove every value under `name`
    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(name)
    }

    /// Number of distinct names
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over names and their value lists
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Iterate over every `(name, value)` row, as stored in the index
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut metadata = Self::new();
        for (k, v) in iter {
            metadata.insert(k, v);
        }
        metadata
    }
}

/// A single value or a list of values, as accepted on the wire
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, OneOrMany>::deserialize(deserializer)?;
        let mut metadata = Self::new();
        for (name, values) in raw {
            match values {
                OneOrMany::One(v) => metadata.insert(name, v),
                OneOrMany::Many(vs) => metadata.set(name, vs),
            }
        }
        Ok(metadata)
    }
}

/// One logical file: identifier, slug, metadata and optionally its bytes
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub slug: String,
    #[serde(default)]
    pub metadata: Metadata,
    /// Raw bytes, only present when explicitly requested
    #[serde(skip)]
    pub data: Option<Bytes>,
}

impl FileRecord {
    /// Create a record without data
    #[must_use]
    pub fn new(id: FileId, slug: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            id,
            slug: slug.into(),
            metadata,
            data: None,
        }
    }
}

/// How a caller addresses a single file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileRef {
    Id(FileId),
    Slug(String),
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Slug(slug) => write!(f, "slug {slug:?}"),
        }
    }
}

impl From<FileId> for FileRef {
    fn from(id: FileId) -> Self {
        Self::Id(id)
    }
}

/// Role a node plays on the shared bus
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeMode {
    /// Claims the durable work queue exclusively
    #[serde(alias = "master")]
    Primary,
    /// Bootstraps from a primary snapshot, then follows the broadcast stream
    #[serde(alias = "slave")]
    Replica,
    /// Follows the broadcast stream without bootstrapping
    #[default]
    #[serde(alias = "noSync", alias = "nosync")]
    NoSync,
}

impl NodeMode {
    /// Whether this node consumes the exclusive work queue
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Primary)
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => f.write_str("primary"),
            Self::Replica => f.write_str("replica"),
            Self::NoSync => f.write_str("no-sync"),
        }
    }
}

impl FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" | "master" => Ok(Self::Primary),
            "replica" | "slave" => Ok(Self::Replica),
            "no-sync" | "nosync" | "noSync" => Ok(Self::NoSync),
            other => Err(format!(
                "invalid node mode {other:?}, expected primary, replica or no-sync"
            )),
        }
    }
}
