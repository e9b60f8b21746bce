//! fileshelf Storage - Local blob storage
//!
//! This crate stores the raw bytes of each file as a flat file under a
//! configured root directory, addressed solely by file id.

pub mod blob;

// Re-exports
pub use blob::{BlobStats, BlobStore};
