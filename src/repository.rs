//! Persistent state contract for file records and sync runs.
//!
//! The engine reads prior file records before a source is synced, upserts
//! one record per processed change, and creates/finalizes one run row per
//! orchestration. Every write targets a distinct
//! `(knowledge_base, source_id, original_uri)` key, so implementations need
//! per-key upserts only, no cross-key locking.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`prior_file_records`](Repository::prior_file_records) | Last known state for a knowledge base or one source |
//! | [`upsert_file_record`](Repository::upsert_file_record) | Insert or update one record |
//! | [`create_sync_run`](Repository::create_sync_run) | Allocate a run id |
//! | [`finalize_sync_run`](Repository::finalize_sync_run) | Persist a terminal run |
//! | [`list_sync_runs`](Repository::list_sync_runs) | Run history, newest first |
//! | [`list_error_records`](Repository::list_error_records) | Files currently in `error` status |

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{FileRecord, FileStatus, SyncMode, SyncRun};

#[async_trait]
pub trait Repository: Send + Sync {
    async fn prior_file_records(
        &self,
        knowledge_base: &str,
        source_id: Option<&str>,
    ) -> Result<Vec<FileRecord>>;

    /// Insert or update a record.
    ///
    /// When a row for the key already carries an identity or sink location,
    /// those values are kept regardless of what `record` says.
    async fn upsert_file_record(&self, record: &FileRecord) -> Result<()>;

    async fn create_sync_run(
        &self,
        knowledge_base: &str,
        mode: SyncMode,
        start_time: DateTime<Utc>,
    ) -> Result<i64>;

    async fn finalize_sync_run(&self, run: &SyncRun) -> Result<()>;

    async fn list_sync_runs(&self, knowledge_base: &str, limit: usize) -> Result<Vec<SyncRun>>;

    async fn list_error_records(&self, knowledge_base: &str) -> Result<Vec<FileRecord>>;
}

type RecordKey = (String, String, String);

fn key_of(record: &FileRecord) -> RecordKey {
    (
        record.knowledge_base.clone(),
        record.source_id.clone(),
        record.original_uri.clone(),
    )
}

/// Apply the identity/location immutability rule to an incoming record.
///
/// A tombstone, or a record whose sink copy was never written, no longer
/// holds its location: a non-empty incoming location replaces it.
pub(crate) fn preserve_assigned(existing: &FileRecord, incoming: &FileRecord) -> FileRecord {
    let mut merged = incoming.clone();
    if !existing.identity.is_empty() {
        merged.identity = existing.identity.clone();
    }
    let released = existing.status == FileStatus::Deleted || existing.file_hash.is_empty();
    if !existing.sink_location.is_empty() && !(released && !incoming.sink_location.is_empty()) {
        merged.sink_location = existing.sink_location.clone();
    }
    merged.created_at = existing.created_at;
    merged
}

/// In-memory repository for tests and embedding in other hosts.
#[derive(Default)]
pub struct InMemoryRepository {
    records: RwLock<HashMap<RecordKey, FileRecord>>,
    runs: RwLock<Vec<SyncRun>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up one record by key.
    pub async fn record(
        &self,
        knowledge_base: &str,
        source_id: &str,
        uri: &str,
    ) -> Option<FileRecord> {
        self.records
            .read()
            .await
            .get(&(
                knowledge_base.to_string(),
                source_id.to_string(),
                uri.to_string(),
            ))
            .cloned()
    }

    pub async fn run(&self, id: i64) -> Option<SyncRun> {
        self.runs.read().await.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn prior_file_records(
        &self,
        knowledge_base: &str,
        source_id: Option<&str>,
    ) -> Result<Vec<FileRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<FileRecord> = records
            .values()
            .filter(|r| r.knowledge_base == knowledge_base)
            .filter(|r| source_id.map_or(true, |s| r.source_id == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (a.source_id.as_str(), a.original_uri.as_str())
                .cmp(&(b.source_id.as_str(), b.original_uri.as_str()))
        });
        Ok(out)
    }

    async fn upsert_file_record(&self, record: &FileRecord) -> Result<()> {
        let mut records = self.records.write().await;
        let key = key_of(record);
        let merged = match records.get(&key) {
            Some(existing) => preserve_assigned(existing, record),
            None => record.clone(),
        };
        records.insert(key, merged);
        Ok(())
    }

    async fn create_sync_run(
        &self,
        knowledge_base: &str,
        mode: SyncMode,
        start_time: DateTime<Utc>,
    ) -> Result<i64> {
        let mut runs = self.runs.write().await;
        let id = runs.len() as i64 + 1;
        runs.push(SyncRun::start(id, knowledge_base, mode, start_time));
        Ok(id)
    }

    async fn finalize_sync_run(&self, run: &SyncRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        let Some(stored) = runs.iter_mut().find(|r| r.id == run.id) else {
            bail!("unknown sync run {}", run.id);
        };
        if stored.is_finalized() {
            bail!("sync run {} is already finalized", run.id);
        }
        *stored = run.clone();
        Ok(())
    }

    async fn list_sync_runs(&self, knowledge_base: &str, limit: usize) -> Result<Vec<SyncRun>> {
        let runs = self.runs.read().await;
        Ok(runs
            .iter()
            .rev()
            .filter(|r| r.knowledge_base == knowledge_base)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_error_records(&self, knowledge_base: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .prior_file_records(knowledge_base, None)
            .await?
            .into_iter()
            .filter(|r| r.status == FileStatus::Error)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Metadata, RunStatus};

    fn record(uri: &str, identity: &str, location: &str, status: FileStatus) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            knowledge_base: "kb".to_string(),
            source_id: "src".to_string(),
            original_uri: uri.to_string(),
            file_hash: "h".to_string(),
            identity: identity.to_string(),
            sink_location: location.to_string(),
            status,
            size: 1,
            source_created_at: None,
            source_modified_at: None,
            error_message: None,
            source_metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn upsert_never_moves_identity_or_location() {
        let repo = InMemoryRepository::new();
        repo.upsert_file_record(&record("a.txt", "id-1.txt", "loc-1", FileStatus::New))
            .await
            .unwrap();
        repo.upsert_file_record(&record("a.txt", "id-2.txt", "loc-2", FileStatus::Modified))
            .await
            .unwrap();

        let stored = repo.record("kb", "src", "a.txt").await.unwrap();
        assert_eq!(stored.identity, "id-1.txt");
        assert_eq!(stored.sink_location, "loc-1");
        assert_eq!(stored.status, FileStatus::Modified);
    }

    #[tokio::test]
    async fn location_can_be_filled_in_later() {
        let repo = InMemoryRepository::new();
        repo.upsert_file_record(&record("a.txt", "id-1.txt", "", FileStatus::Error))
            .await
            .unwrap();
        repo.upsert_file_record(&record("a.txt", "id-1.txt", "loc-1", FileStatus::New))
            .await
            .unwrap();
        let stored = repo.record("kb", "src", "a.txt").await.unwrap();
        assert_eq!(stored.sink_location, "loc-1");
    }

    #[tokio::test]
    async fn restore_from_tombstone_takes_the_new_location() {
        let repo = InMemoryRepository::new();
        repo.upsert_file_record(&record("a.txt", "id-1.txt", "loc-1", FileStatus::Deleted))
            .await
            .unwrap();
        repo.upsert_file_record(&record("a.txt", "id-2.txt", "loc-2", FileStatus::New))
            .await
            .unwrap();

        let stored = repo.record("kb", "src", "a.txt").await.unwrap();
        assert_eq!(stored.identity, "id-1.txt");
        assert_eq!(stored.sink_location, "loc-2");
        assert_eq!(stored.status, FileStatus::New);
    }

    #[tokio::test]
    async fn prior_records_filter_by_source_and_errors_are_listed() {
        let repo = InMemoryRepository::new();
        repo.upsert_file_record(&record("a.txt", "a", "la", FileStatus::New))
            .await
            .unwrap();
        let mut other = record("b.txt", "b", "", FileStatus::Error);
        other.source_id = "other".to_string();
        repo.upsert_file_record(&other).await.unwrap();

        assert_eq!(repo.prior_file_records("kb", None).await.unwrap().len(), 2);
        assert_eq!(
            repo.prior_file_records("kb", Some("src"))
                .await
                .unwrap()
                .len(),
            1
        );
        let errors = repo.list_error_records("kb").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].original_uri, "b.txt");
    }

    #[tokio::test]
    async fn runs_finalize_exactly_once() {
        let repo = InMemoryRepository::new();
        let start = Utc::now();
        let id = repo
            .create_sync_run("kb", SyncMode::Sequential, start)
            .await
            .unwrap();
        let mut run = SyncRun::start(id, "kb", SyncMode::Sequential, start);
        run.status = RunStatus::Completed;
        run.end_time = Some(Utc::now());

        repo.finalize_sync_run(&run).await.unwrap();
        assert!(repo.finalize_sync_run(&run).await.is_err());
        assert_eq!(repo.list_sync_runs("kb", 10).await.unwrap(), vec![run]);
    }
}
