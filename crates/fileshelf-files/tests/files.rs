//! End-to-end behaviour of a single node

use bytes::Bytes;
use fileshelf_bus::LoopbackBus;
use fileshelf_common::{Config, Error, FileRef, Metadata};
use fileshelf_files::{Criteria, FileService, Filter, Order, SaveRequest};
use std::sync::Arc;
use tempfile::TempDir;

async fn node() -> (FileService, TempDir) {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.storage_path = dir.path().join("blobs");
    config.storage.database_path = dir.path().join("index.db");
    config.writer.commit_timeout_ms = 2_000;
    let service = FileService::open(config, Arc::new(LoopbackBus::new()))
        .await
        .unwrap();
    (service, dir)
}

fn slug(file: &str) -> FileRef {
    FileRef::Slug(file.to_string())
}

fn slugs(records: &[fileshelf_common::FileRecord]) -> Vec<&str> {
    records.iter().map(|r| r.slug.as_str()).collect()
}

#[tokio::test]
async fn test_save_then_get_round_trips() {
    let (files, _dir) = node().await;
    let metadata = Metadata::new()
        .with("tag", "x")
        .with("tag", "y")
        .with("owner", "ana");

    let saved = files
        .save(SaveRequest::new("docs/report.pdf").with_metadata(metadata.clone()))
        .await
        .unwrap();
    let fetched = files.get(saved.id, false).await.unwrap();

    assert_eq!(fetched.slug, "docs/report.pdf");
    assert_eq!(fetched.metadata, metadata);
    assert_eq!(fetched.data, None);
    files.close();
}

#[tokio::test]
async fn test_slug_conflict_then_rename() {
    let (files, _dir) = node().await;
    let first = files.save(SaveRequest::new("a.txt")).await.unwrap();

    let err = files.save(SaveRequest::new("a.txt")).await.unwrap_err();
    assert!(matches!(err, Error::SlugTaken(ref s) if s == "a.txt"));

    files
        .save(SaveRequest::new("renamed.txt").with_id(first.id))
        .await
        .unwrap();
    let second = files.save(SaveRequest::new("a.txt")).await.unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(files.get(slug("renamed.txt"), false).await.unwrap().id, first.id);
    files.close();
}

#[tokio::test]
async fn test_rename_onto_taken_slug_fails() {
    let (files, _dir) = node().await;
    let a = files.save(SaveRequest::new("a.txt")).await.unwrap();
    let b = files
        .save(
            SaveRequest::new("b.txt")
                .with_data(&b"bee"[..])
                .with_metadata(Metadata::new().with("tag", "b")),
        )
        .await
        .unwrap();

    let err = files
        .save(SaveRequest::new("a.txt").with_id(b.id))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SlugTaken(ref s) if s == "a.txt"));

    let unchanged = files.get(b.id, true).await.unwrap();
    assert_eq!(unchanged, b);
    assert_eq!(files.uuid_from_slug("a.txt").await.unwrap(), Some(a.id));
    files.close();
}

#[tokio::test]
async fn test_and_filter_needs_every_value() {
    let (files, _dir) = node().await;
    files
        .save(SaveRequest::new("both").with_metadata(Metadata::new().with("a", "x").with("a", "y")))
        .await
        .unwrap();
    files
        .save(SaveRequest::new("only-x").with_metadata(Metadata::new().with("a", "x")))
        .await
        .unwrap();

    let found = files
        .list(&Criteria::all().with_filter(Filter::and().eq("a", "x").eq("a", "y")))
        .await
        .unwrap();
    assert_eq!(slugs(&found), ["both"]);
    files.close();
}

#[tokio::test]
async fn test_or_filter_is_a_union() {
    let (files, _dir) = node().await;
    for (name, metadata) in [
        ("red", Metadata::new().with("color", "red")),
        ("big", Metadata::new().with("size", "big")),
        ("plain", Metadata::new().with("color", "blue")),
    ] {
        files
            .save(SaveRequest::new(name).with_metadata(metadata))
            .await
            .unwrap();
    }

    let found = files
        .list(
            &Criteria::all()
                .with_filter(Filter::or().eq("color", "red").eq("size", "big"))
                .with_order(Order::asc("slug")),
        )
        .await
        .unwrap();
    assert_eq!(slugs(&found), ["big", "red"]);
    files.close();
}

#[tokio::test]
async fn test_exists_predicate_ignores_value() {
    let (files, _dir) = node().await;
    files
        .save(SaveRequest::new("one").with_metadata(Metadata::new().with("n", "1")))
        .await
        .unwrap();
    files
        .save(SaveRequest::new("two").with_metadata(Metadata::new().with("n", "2")))
        .await
        .unwrap();
    files
        .save(SaveRequest::new("none").with_metadata(Metadata::new().with("m", "1")))
        .await
        .unwrap();

    let criteria: Criteria = serde_json::from_str(
        r#"{"filter": {"metadata": {"n": true}}, "order": {"column": "slug", "dir": "asc"}}"#,
    )
    .unwrap();
    let found = files.list(&criteria).await.unwrap();
    assert_eq!(slugs(&found), ["one", "two"]);
    files.close();
}

#[tokio::test]
async fn test_too_many_and_predicates() {
    let (files, _dir) = node().await;
    let filter = (0..61).fold(Filter::and(), |f, i| f.eq(format!("k{i}"), "v"));

    let err = files
        .list(&Criteria::all().with_filter(filter))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TooManyPredicates { count: 61, max: 60 }));
    files.close();
}

#[tokio::test]
async fn test_rm_then_get_is_not_found() {
    let (files, _dir) = node().await;
    let saved = files
        .save(SaveRequest::new("gone.txt").with_data(&b"bye"[..]))
        .await
        .unwrap();
    let id = saved.id.to_string();

    files.rm(&id).await.unwrap();
    assert!(files.get(saved.id, false).await.unwrap_err().is_not_found());
    assert!(files.get(slug("gone.txt"), true).await.unwrap_err().is_not_found());

    // Second removal is a no-op
    files.rm(&id).await.unwrap();
    files.close();
}

#[tokio::test]
async fn test_tagged_files_scenario() {
    let (files, _dir) = node().await;
    files
        .save(
            SaveRequest::new("a.txt")
                .with_data(&b"hi"[..])
                .with_metadata(Metadata::new().with("tag", "x")),
        )
        .await
        .unwrap();

    let a = files.get(slug("a.txt"), true).await.unwrap();
    assert_eq!(a.slug, "a.txt");
    assert_eq!(a.data, Some(Bytes::from_static(b"hi")));
    assert_eq!(a.metadata.get("tag"), Some(&["x".to_string()][..]));

    files
        .save(SaveRequest::new("b.txt").with_metadata(Metadata::new().with("tag", "x").with("other", "y")))
        .await
        .unwrap();

    let tagged = files
        .list(
            &Criteria::all()
                .with_filter(Filter::and().eq("tag", "x"))
                .with_order(Order::asc("slug")),
        )
        .await
        .unwrap();
    assert_eq!(slugs(&tagged), ["a.txt", "b.txt"]);
    assert!(tagged.iter().all(|r| r.data.is_none()));

    let both = files
        .list(&Criteria::all().with_filter(Filter::and().eq("tag", "x").eq("other", "y")))
        .await
        .unwrap();
    assert_eq!(slugs(&both), ["b.txt"]);
    files.close();
}

#[tokio::test]
async fn test_order_by_metadata_score() {
    let (files, _dir) = node().await;
    for (name, score) in [("three", "3"), ("one", "1"), ("two", "2")] {
        files
            .save(SaveRequest::new(name).with_metadata(Metadata::new().with("score", score)))
            .await
            .unwrap();
    }

    let criteria: Criteria =
        serde_json::from_str(r#"{"order": {"column": "metadata:score", "dir": "asc"}}"#).unwrap();
    let found = files.list(&criteria).await.unwrap();
    assert_eq!(slugs(&found), ["one", "two", "three"]);

    let found = files
        .list(&Criteria::all().with_order(Order::desc("metadata:score")).with_limit(2))
        .await
        .unwrap();
    assert_eq!(slugs(&found), ["three", "two"]);
    files.close();
}

#[tokio::test]
async fn test_list_by_slugs_and_ids() {
    let (files, _dir) = node().await;
    let a = files.save(SaveRequest::new("a")).await.unwrap();
    files.save(SaveRequest::new("b")).await.unwrap();

    let by_slug = files.list(&Criteria::slugs(["b", "missing"])).await.unwrap();
    assert_eq!(slugs(&by_slug), ["b"]);

    let by_id = files.list(&Criteria::ids([a.id])).await.unwrap();
    assert_eq!(slugs(&by_id), ["a"]);

    assert!(files.list(&Criteria::ids([])).await.unwrap().is_empty());
    files.close();
}

#[tokio::test]
async fn test_uuid_from_slug() {
    let (files, _dir) = node().await;
    let saved = files.save(SaveRequest::new("a.txt")).await.unwrap();
    assert_eq!(files.uuid_from_slug("a.txt").await.unwrap(), Some(saved.id));
    assert_eq!(files.uuid_from_slug("b.txt").await.unwrap(), None);
    files.close();
}

#[tokio::test]
async fn test_reopen_keeps_files() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.storage_path = dir.path().join("blobs");
    config.storage.database_path = dir.path().join("index.db");

    let files = FileService::open(config.clone(), Arc::new(LoopbackBus::new()))
        .await
        .unwrap();
    let saved = files
        .save(SaveRequest::new("kept.txt").with_data(&b"still here"[..]))
        .await
        .unwrap();
    files.close();
    drop(files);

    let files = FileService::open(config, Arc::new(LoopbackBus::new()))
        .await
        .unwrap();
    let fetched = files.get(saved.id, true).await.unwrap();
    assert_eq!(fetched.data.as_deref(), Some(&b"still here"[..]));
    files.close();
}
