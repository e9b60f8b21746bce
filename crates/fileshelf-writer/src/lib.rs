//! fileshelf Writer - replicated write coordinator
//!
//! This crate serializes every mutation of the metadata index through the
//! shared message bus, and bootstraps late-joining replicas from a primary's
//! snapshot.

pub mod command;
pub mod coordinator;
pub mod sync;

// Re-exports
pub use command::{Command, Envelope, RemovePayload, SavePayload};
pub use coordinator::{CoordinatorStats, Readiness, WriteCoordinator};
pub use sync::{SnapshotServer, SyncMessage, fetch_snapshot};
