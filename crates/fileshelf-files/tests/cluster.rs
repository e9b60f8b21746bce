//! Several nodes sharing one bus

use fileshelf_bus::{LoopbackBus, Message, MessageBus};
use fileshelf_common::{Config, Error, FileId, FileRef, Metadata, NodeMode};
use fileshelf_files::{Criteria, FileService, Order, SaveRequest};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Node {
    files: FileService,
    _dir: TempDir,
}

async fn start(bus: &LoopbackBus, name: &str, mode: NodeMode, replicate_blobs: bool) -> Node {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.name = name.to_string();
    config.node.mode = mode;
    config.storage.storage_path = dir.path().join("blobs");
    config.storage.database_path = dir.path().join("index.db");
    config.writer.commit_timeout_ms = 2_000;
    config.writer.replicate_blobs = replicate_blobs;
    config.sync.request_timeout_ms = 2_000;

    let files = FileService::open(config, Arc::new(bus.clone())).await.unwrap();
    Node { files, _dir: dir }
}

/// Poll `check` until it holds or two seconds pass
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn has_file(node: &Node, id: FileId) -> bool {
    node.files.get(id, false).await.is_ok()
}

async fn has_blob(node: &Node, id: FileId) -> bool {
    node.files.get(id, true).await.is_ok()
}

async fn is_gone(node: &Node, id: FileId) -> bool {
    matches!(node.files.get(id, true).await, Err(Error::FileNotFound(_)))
}

#[tokio::test]
async fn test_writes_converge_across_nodes() {
    let bus = LoopbackBus::new();
    let primary = start(&bus, "primary", NodeMode::Primary, false).await;
    let follower = start(&bus, "follower", NodeMode::NoSync, false).await;

    let from_primary = primary
        .files
        .save(SaveRequest::new("p.txt").with_metadata(Metadata::new().with("by", "primary")))
        .await
        .unwrap();
    let from_follower = follower
        .files
        .save(SaveRequest::new("f.txt").with_metadata(Metadata::new().with("by", "follower")))
        .await
        .unwrap();

    eventually(|| has_file(&follower, from_primary.id)).await;
    eventually(|| has_file(&primary, from_follower.id)).await;

    let by_slug = Criteria::all().with_order(Order::asc("slug"));
    let on_primary = primary.files.list(&by_slug).await.unwrap();
    let on_follower = follower.files.list(&by_slug).await.unwrap();
    assert_eq!(on_primary.len(), 2);
    assert_eq!(on_primary, on_follower);

    follower.files.rm(&from_primary.id.to_string()).await.unwrap();
    eventually(|| is_gone(&primary, from_primary.id)).await;

    primary.files.close();
    follower.files.close();
}

#[tokio::test]
async fn test_slug_conflict_is_seen_by_other_nodes() {
    let bus = LoopbackBus::new();
    let primary = start(&bus, "primary", NodeMode::Primary, false).await;
    let follower = start(&bus, "follower", NodeMode::NoSync, false).await;

    let saved = primary.files.save(SaveRequest::new("a.txt")).await.unwrap();
    eventually(|| has_file(&follower, saved.id)).await;

    let err = follower.files.save(SaveRequest::new("a.txt")).await.unwrap_err();
    assert!(matches!(err, Error::SlugTaken(_)));

    primary.files.close();
    follower.files.close();
}

#[tokio::test]
async fn test_replica_bootstraps_from_primary() {
    let bus = LoopbackBus::new();
    let primary = start(&bus, "primary", NodeMode::Primary, false).await;
    let before = primary
        .files
        .save(SaveRequest::new("before.txt").with_metadata(Metadata::new().with("tag", "x")))
        .await
        .unwrap();

    let replica = start(&bus, "replica", NodeMode::Replica, false).await;
    let copied = replica.files.get(before.id, false).await.unwrap();
    assert_eq!(copied.slug, "before.txt");
    assert_eq!(copied.metadata.first("tag"), Some("x"));

    // Live commands keep flowing after the snapshot
    let after = primary.files.save(SaveRequest::new("after.txt")).await.unwrap();
    eventually(|| has_file(&replica, after.id)).await;

    primary.files.close();
    replica.files.close();
}

#[tokio::test]
async fn test_replica_without_primary_is_not_ready() {
    let bus = LoopbackBus::new();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.mode = NodeMode::Replica;
    config.storage.storage_path = dir.path().join("blobs");
    config.storage.database_path = dir.path().join("index.db");
    config.sync.request_timeout_ms = 100;

    let err = FileService::open(config, Arc::new(bus)).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_) | Error::Bus(_)));
}

#[tokio::test]
async fn test_failed_open_stops_listening() {
    let bus = LoopbackBus::new();
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.node.mode = NodeMode::Replica;
    config.storage.storage_path = dir.path().join("blobs");
    config.storage.database_path = dir.path().join("index.db");
    config.sync.request_timeout_ms = 100;
    assert!(FileService::open(config, Arc::new(bus.clone())).await.is_err());
    tokio::time::sleep(Duration::from_millis(20)).await;

    // A live listener would retry its bootstrap and ask for a snapshot
    let mut sync = bus.subscribe("fileshelf_dataDump").await.unwrap();
    bus.publish("fileshelf", Message::new(&b"{}"[..])).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(300), sync.next())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_dropped_primary_releases_work_queue() {
    let bus = LoopbackBus::new();
    let first = start(&bus, "primary", NodeMode::Primary, false).await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = start(&bus, "primary-2", NodeMode::Primary, false).await;
    let saved = second.files.save(SaveRequest::new("a.txt")).await.unwrap();
    assert!(has_file(&second, saved.id).await);
}

#[tokio::test]
async fn test_blobs_stay_local_without_replication() {
    let bus = LoopbackBus::new();
    let primary = start(&bus, "primary", NodeMode::Primary, false).await;
    let follower = start(&bus, "follower", NodeMode::NoSync, false).await;

    let saved = primary
        .files
        .save(SaveRequest::new("a.txt").with_data(&b"hi"[..]))
        .await
        .unwrap();
    eventually(|| has_file(&follower, saved.id)).await;

    // Metadata arrives, bytes do not
    let err = follower.files.get(saved.id, true).await.unwrap_err();
    assert!(matches!(err, Error::BlobMissing { id } if id == saved.id));

    primary.files.close();
    follower.files.close();
}

#[tokio::test]
async fn test_blobs_travel_with_replication() {
    let bus = LoopbackBus::new();
    let primary = start(&bus, "primary", NodeMode::Primary, true).await;
    let follower = start(&bus, "follower", NodeMode::NoSync, true).await;

    let saved = follower
        .files
        .save(SaveRequest::new("a.txt").with_data(&b"hi"[..]))
        .await
        .unwrap();
    assert_eq!(saved.data.as_deref(), Some(&b"hi"[..]));

    eventually(|| has_blob(&primary, saved.id)).await;
    let copy = primary.files.get(FileRef::Slug("a.txt".into()), true).await.unwrap();
    assert_eq!(copy.data.as_deref(), Some(&b"hi"[..]));

    primary.files.rm(&saved.id.to_string()).await.unwrap();
    eventually(|| is_gone(&follower, saved.id)).await;

    primary.files.close();
    follower.files.close();
}
