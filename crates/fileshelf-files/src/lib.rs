//! fileshelf Files - public file surface
//!
//! [`FileService`] composes the metadata index, blob storage and the write
//! coordinator into `get`/`list`/`save`/`rm`.

pub mod service;

// Re-exports
pub use fileshelf_meta_store::{Criteria, Direction, Filter, Operator, Order, Predicate};
pub use service::{FileService, SaveRequest};
