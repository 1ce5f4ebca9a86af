//! Integration tests for the SQLite repository and the built-in connectors.
//!
//! Each test gets its own temporary directory holding the database, the
//! filesystem source tree, and the local sink root.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use kb_sync::config::parse_config;
use kb_sync::models::{FileRecord, FileStatus, Metadata, RunStatus, SourceStats, SyncMode};
use kb_sync::orchestrator::SyncOrchestrator;
use kb_sync::repository::Repository;
use kb_sync::sqlite_repo::SqliteRepository;
use kb_sync::traits::{SinkFactory, SourceFactory};
use kb_sync::{db, migrate};
use tempfile::TempDir;

async fn open_repo(dir: &Path) -> SqliteRepository {
    let pool = db::connect_path(&dir.join("state.sqlite")).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    SqliteRepository::new(pool)
}

fn record(uri: &str, identity: &str, location: &str, status: FileStatus) -> FileRecord {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let mut metadata = Metadata::new();
    metadata.insert("team".to_string(), "platform".to_string());
    FileRecord {
        knowledge_base: "kb".to_string(),
        source_id: "docs".to_string(),
        original_uri: uri.to_string(),
        file_hash: "abc123".to_string(),
        identity: identity.to_string(),
        sink_location: location.to_string(),
        status,
        size: 42,
        source_created_at: Some(created),
        source_modified_at: Some(created + chrono::Duration::milliseconds(1_250)),
        error_message: None,
        source_metadata: metadata,
        created_at: created,
        updated_at: created,
    }
}

#[tokio::test]
async fn migrations_are_idempotent() {
    let tmp = TempDir::new().unwrap();
    let repo = open_repo(tmp.path()).await;
    migrate::run_migrations(repo.pool()).await.unwrap();
    assert!(repo.prior_file_records("kb", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn file_records_round_trip_and_keep_identity() {
    let tmp = TempDir::new().unwrap();
    let repo = open_repo(tmp.path()).await;

    let first = record("a.md", "id-a.md", "loc/a", FileStatus::New);
    repo.upsert_file_record(&first).await.unwrap();

    let stored = repo.prior_file_records("kb", Some("docs")).await.unwrap();
    assert_eq!(stored, vec![first.clone()]);

    let mut second = record("a.md", "other.md", "loc/other", FileStatus::Modified);
    second.file_hash = "def456".to_string();
    second.created_at = Utc::now();
    second.updated_at = Utc::now();
    repo.upsert_file_record(&second).await.unwrap();

    let stored = repo.prior_file_records("kb", None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].identity, "id-a.md");
    assert_eq!(stored[0].sink_location, "loc/a");
    assert_eq!(stored[0].file_hash, "def456");
    assert_eq!(stored[0].status, FileStatus::Modified);
    assert_eq!(stored[0].created_at, first.created_at);

    assert!(repo
        .prior_file_records("kb", Some("elsewhere"))
        .await
        .unwrap()
        .is_empty());
    assert!(repo.prior_file_records("other-kb", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn identity_can_be_filled_in_after_an_error() {
    let tmp = TempDir::new().unwrap();
    let repo = open_repo(tmp.path()).await;

    let mut failed = record("b.md", "id-b.md", "", FileStatus::Error);
    failed.error_message = Some("upload refused".to_string());
    repo.upsert_file_record(&failed).await.unwrap();
    assert_eq!(repo.list_error_records("kb").await.unwrap().len(), 1);

    repo.upsert_file_record(&record("b.md", "id-b.md", "loc/b", FileStatus::New))
        .await
        .unwrap();
    let stored = repo.prior_file_records("kb", None).await.unwrap();
    assert_eq!(stored[0].sink_location, "loc/b");
    assert!(stored[0].error_message.is_none());
    assert!(repo.list_error_records("kb").await.unwrap().is_empty());
}

#[tokio::test]
async fn restored_file_takes_the_location_of_its_new_upload() {
    let tmp = TempDir::new().unwrap();
    let repo = open_repo(tmp.path()).await;

    repo.upsert_file_record(&record("c.md", "id-c.md", "loc/c-1", FileStatus::Deleted))
        .await
        .unwrap();
    repo.upsert_file_record(&record("c.md", "id-c.md", "loc/c-2", FileStatus::New))
        .await
        .unwrap();

    let stored = repo.prior_file_records("kb", None).await.unwrap();
    assert_eq!(stored[0].identity, "id-c.md");
    assert_eq!(stored[0].sink_location, "loc/c-2");
    assert_eq!(stored[0].status, FileStatus::New);

    // Once synced again, the location is fixed.
    repo.upsert_file_record(&record("c.md", "other.md", "loc/c-3", FileStatus::Modified))
        .await
        .unwrap();
    let stored = repo.prior_file_records("kb", None).await.unwrap();
    assert_eq!(stored[0].sink_location, "loc/c-2");
}

#[tokio::test]
async fn sync_runs_finalize_exactly_once() {
    let tmp = TempDir::new().unwrap();
    let repo = open_repo(tmp.path()).await;

    let start = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
    let id = repo
        .create_sync_run("kb", SyncMode::Sequential, start)
        .await
        .unwrap();

    let running = repo.list_sync_runs("kb", 5).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].status, RunStatus::Running);
    assert!(running[0].sources_processed.is_empty());

    let mut run = running[0].clone();
    let stats = SourceStats {
        processed: 4,
        new: 1,
        unchanged: 2,
        errors: 1,
        ..Default::default()
    };
    run.status = RunStatus::Failed;
    run.end_time = Some(start + chrono::Duration::seconds(3));
    run.totals = stats;
    run.sources_processed = vec!["docs".to_string(), "wiki".to_string()];
    run.per_source_stats = BTreeMap::from([
        ("docs".to_string(), stats),
        ("wiki".to_string(), SourceStats::default()),
    ]);
    run.source_errors = BTreeMap::from([("wiki".to_string(), "listing denied".to_string())]);
    run.error_message = Some("1 of 2 sources failed".to_string());

    repo.finalize_sync_run(&run).await.unwrap();
    assert!(repo.finalize_sync_run(&run).await.is_err());

    let listed = repo.list_sync_runs("kb", 5).await.unwrap();
    assert_eq!(listed, vec![run]);
    assert_eq!(listed[0].id, id);
    assert!(repo.list_sync_runs("other", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn filesystem_to_local_sink_end_to_end() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    let sink_root = tmp.path().join("sink");
    std::fs::create_dir_all(docs.join("guides")).unwrap();
    std::fs::create_dir_all(docs.join(".git")).unwrap();
    std::fs::write(docs.join("README.md"), "# Handbook").unwrap();
    std::fs::write(docs.join("guides/deploy.md"), "deploy steps").unwrap();
    std::fs::write(docs.join("notes.tmp"), "scratch").unwrap();
    std::fs::write(docs.join(".git/config"), "[core]").unwrap();

    let cfg = parse_config(&format!(
        r#"
[db]
path = "{db}"

[sync]
mode = "sequential"

[knowledge_bases.handbook.sink]
type = "local"
root = "{sink}"
prefix = "handbook/"

[[knowledge_bases.handbook.sources]]
source_id = "docs"
source_type = "filesystem"
metadata_tags = {{ team = "platform" }}
[knowledge_bases.handbook.sources.config]
root = "{docs}"
exclude_globs = ["**/*.tmp"]
"#,
        db = tmp.path().join("state.sqlite").display(),
        sink = sink_root.display(),
        docs = docs.display(),
    ))
    .unwrap();

    let kb = cfg.knowledge_base("handbook").unwrap();
    let sink = SinkFactory::with_builtins().create(&kb.sink).unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    migrate::run_migrations(&pool).await.unwrap();
    let repo = Arc::new(SqliteRepository::new(pool));
    let orchestrator = SyncOrchestrator::new(repo.clone(), SourceFactory::with_builtins());

    let first = orchestrator
        .run("handbook", &kb.sources, sink.clone(), &cfg.sync.options())
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.mode, SyncMode::Sequential);
    assert_eq!(first.totals.new, 2);

    let stored = sink.list_documents("handbook/").await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|d| d.metadata["team"] == "platform"));

    let records = repo.prior_file_records("handbook", None).await.unwrap();
    let uris: Vec<&str> = records.iter().map(|r| r.original_uri.as_str()).collect();
    assert_eq!(uris, vec!["README.md", "guides/deploy.md"]);
    let deploy = records[1].clone();
    assert!(deploy.sink_location.starts_with("handbook/"));
    assert!(deploy.identity.ends_with(".md"));

    // Edit one file, delete the other.
    std::fs::write(docs.join("guides/deploy.md"), "deploy steps, now with rollback").unwrap();
    std::fs::remove_file(docs.join("README.md")).unwrap();

    let second = orchestrator
        .run("handbook", &kb.sources, sink.clone(), &cfg.sync.options())
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.totals.modified, 1);
    assert_eq!(second.totals.deleted, 1);
    assert_eq!(second.totals.processed, 2);

    let info = sink
        .get_metadata(&deploy.sink_location)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.identity, deploy.identity);
    assert_eq!(info.size, "deploy steps, now with rollback".len() as u64);
    assert_eq!(sink.list_documents("handbook/").await.unwrap().len(), 1);

    let runs = repo.list_sync_runs("handbook", 10).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id, second.id);
    assert_eq!(runs[0].totals, second.totals);
}
