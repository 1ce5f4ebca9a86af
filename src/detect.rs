//! Change detection: classify a source listing against prior state.
//!
//! Checks run cheapest first so unchanged files are never read:
//!
//! 1. Not in prior state, or known only as a tombstone or a record with
//!    nothing synced → **New**.
//! 2. In prior state but not observed → **Deleted**, once.
//! 3. Size differs → **Modified**, no hashing.
//! 4. Modification time differs beyond the tolerance → hash to confirm.
//!    Equal hash → **Unchanged**, different → **Modified** with the hash
//!    carried forward.
//! 5. Otherwise → **Unchanged**.
//!
//! A read or hash failure during confirmation classifies the file as
//! Modified.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::identity::hash_reader;
use crate::models::{Change, ChangeKind, FileRecord, FileStatus, ObservedFile};
use crate::traits::Source;

/// Default tolerance for modification time comparisons.
pub const DEFAULT_MTIME_TOLERANCE: Duration = Duration::from_secs(2);

/// Outcome of the metadata-only checks for a file present on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heuristic {
    Modified,
    NeedsHash,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    mtime_tolerance: Duration,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_MTIME_TOLERANCE)
    }
}

impl ChangeDetector {
    pub fn new(mtime_tolerance: Duration) -> Self {
        Self { mtime_tolerance }
    }

    /// Compare size and modification time without touching content.
    pub fn compare_metadata(&self, observed: &ObservedFile, previous: &FileRecord) -> Heuristic {
        if observed.size != previous.size {
            return Heuristic::Modified;
        }
        match (observed.modified_at, previous.source_modified_at) {
            (Some(now), Some(before)) => {
                let drift_ms = (now - before).num_milliseconds().unsigned_abs();
                if u128::from(drift_ms) > self.mtime_tolerance.as_millis() {
                    Heuristic::NeedsHash
                } else {
                    Heuristic::Unchanged
                }
            }
            _ => Heuristic::Unchanged,
        }
    }

    /// Classify every observed and previously known file.
    ///
    /// `source` is only used to read content for hash confirmation. Nothing
    /// is written anywhere; output order is not significant.
    pub async fn detect(
        &self,
        observed: &[ObservedFile],
        prior: &[FileRecord],
        source: &dyn Source,
    ) -> Vec<Change> {
        self.detect_until(observed, prior, source, &CancellationToken::new())
            .await
            .unwrap_or_default()
    }

    /// [`detect`](Self::detect), giving up with `None` once `cancel` fires.
    ///
    /// Each hash-confirmation read races the token, so a slow source cannot
    /// hold detection past a deadline.
    pub async fn detect_until(
        &self,
        observed: &[ObservedFile],
        prior: &[FileRecord],
        source: &dyn Source,
        cancel: &CancellationToken,
    ) -> Option<Vec<Change>> {
        let previous_by_uri: HashMap<&str, &FileRecord> = prior
            .iter()
            .map(|r| (r.original_uri.as_str(), r))
            .collect();

        let mut changes = Vec::with_capacity(observed.len());
        let mut seen: HashSet<&str> = HashSet::with_capacity(observed.len());

        for file in observed {
            if !seen.insert(file.uri.as_str()) {
                tracing::warn!(uri = %file.uri, "duplicate uri in listing, ignoring");
                continue;
            }

            let Some(&previous) = previous_by_uri.get(file.uri.as_str()) else {
                changes.push(change(file, ChangeKind::New, None, None));
                continue;
            };

            // Tombstones and records with nothing synced in the sink start over.
            if previous.status == FileStatus::Deleted
                || !previous.has_location()
                || previous.file_hash.is_empty()
            {
                changes.push(change(file, ChangeKind::New, Some(previous), None));
                continue;
            }

            let classified = match self.compare_metadata(file, previous) {
                Heuristic::Modified => change(file, ChangeKind::Modified, Some(previous), None),
                Heuristic::Unchanged => change(file, ChangeKind::Unchanged, Some(previous), None),
                Heuristic::NeedsHash => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return None,
                    confirmed = self.confirm(file, previous, source) => confirmed,
                },
            };
            tracing::debug!(uri = %file.uri, kind = %classified.kind, "classified");
            changes.push(classified);
        }

        for previous in prior {
            if seen.contains(previous.original_uri.as_str()) {
                continue;
            }
            if previous.status == FileStatus::Deleted {
                continue;
            }
            changes.push(Change {
                uri: previous.original_uri.clone(),
                kind: ChangeKind::Deleted,
                observed: None,
                previous: Some(previous.clone()),
                precomputed_hash: None,
            });
        }

        Some(changes)
    }

    async fn confirm(&self, file: &ObservedFile, previous: &FileRecord, source: &dyn Source) -> Change {
        match hash_content(source, &file.uri).await {
            Ok(hash) if hash == previous.file_hash => {
                change(file, ChangeKind::Unchanged, Some(previous), None)
            }
            Ok(hash) => change(file, ChangeKind::Modified, Some(previous), Some(hash)),
            Err(e) => {
                tracing::warn!(
                    uri = %file.uri,
                    error = %format!("{:#}", e),
                    "hash confirmation failed, treating as modified"
                );
                change(file, ChangeKind::Modified, Some(previous), None)
            }
        }
    }
}

async fn hash_content(source: &dyn Source, uri: &str) -> Result<String> {
    let mut stream = source.read_stream(uri).await?;
    Ok(hash_reader(&mut stream).await?)
}

fn change(
    file: &ObservedFile,
    kind: ChangeKind,
    previous: Option<&FileRecord>,
    precomputed_hash: Option<String>,
) -> Change {
    Change {
        uri: file.uri.clone(),
        kind,
        observed: Some(file.clone()),
        previous: previous.cloned(),
        precomputed_hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::hash_bytes;
    use crate::models::Metadata;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubSource {
        content: HashMap<String, Vec<u8>>,
        reads: AtomicUsize,
    }

    impl StubSource {
        fn new(files: &[(&str, &[u8])]) -> Self {
            Self {
                content: files
                    .iter()
                    .map(|(u, c)| (u.to_string(), c.to_vec()))
                    .collect(),
                reads: AtomicUsize::new(0),
            }
        }

        fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Source for StubSource {
        fn source_type(&self) -> &str {
            "stub"
        }

        async fn list_files(&self) -> Result<Vec<ObservedFile>> {
            Ok(Vec::new())
        }

        async fn get_content(&self, uri: &str) -> Result<Vec<u8>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.content
                .get(uri)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such file: {}", uri))
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn observed(uri: &str, size: u64, mtime: i64) -> ObservedFile {
        ObservedFile {
            uri: uri.to_string(),
            size,
            content_type: "text/plain".to_string(),
            created_at: None,
            modified_at: Some(ts(mtime)),
        }
    }

    fn record(uri: &str, size: u64, mtime: i64, hash: &str, status: FileStatus) -> FileRecord {
        FileRecord {
            knowledge_base: "kb".to_string(),
            source_id: "src".to_string(),
            original_uri: uri.to_string(),
            file_hash: hash.to_string(),
            identity: format!("{}-id", uri),
            sink_location: format!("mock://{}-id", uri),
            status,
            size,
            source_created_at: None,
            source_modified_at: Some(ts(mtime)),
            error_message: None,
            source_metadata: Metadata::new(),
            created_at: ts(0),
            updated_at: ts(0),
        }
    }

    fn kind_of(changes: &[Change], uri: &str) -> Option<ChangeKind> {
        changes.iter().find(|c| c.uri == uri).map(|c| c.kind)
    }

    #[tokio::test]
    async fn classifies_new_modified_unchanged_deleted() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[
                    observed("a.txt", 10, 0),
                    observed("b.txt", 20, 5),
                    observed("c.txt", 35, 9),
                ],
                &[
                    record("b.txt", 20, 5, "hb", FileStatus::Unchanged),
                    record("c.txt", 30, 9, "hc", FileStatus::New),
                    record("d.txt", 40, 0, "hd", FileStatus::Modified),
                ],
                &source,
            )
            .await;

        assert_eq!(changes.len(), 4);
        assert_eq!(kind_of(&changes, "a.txt"), Some(ChangeKind::New));
        assert_eq!(kind_of(&changes, "b.txt"), Some(ChangeKind::Unchanged));
        assert_eq!(kind_of(&changes, "c.txt"), Some(ChangeKind::Modified));
        assert_eq!(kind_of(&changes, "d.txt"), Some(ChangeKind::Deleted));
        assert_eq!(source.reads(), 0, "metadata checks must not read content");
    }

    #[tokio::test]
    async fn mtime_within_tolerance_is_unchanged() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[observed("a.txt", 5, 2)],
                &[record("a.txt", 5, 0, "h", FileStatus::New)],
                &source,
            )
            .await;
        assert_eq!(changes[0].kind, ChangeKind::Unchanged);
        assert_eq!(source.reads(), 0);
    }

    #[tokio::test]
    async fn mtime_drift_with_same_hash_is_unchanged() {
        let source = StubSource::new(&[("a.txt", b"hello")]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[observed("a.txt", 5, 60)],
                &[record("a.txt", 5, 0, &hash_bytes(b"hello"), FileStatus::New)],
                &source,
            )
            .await;
        assert_eq!(changes[0].kind, ChangeKind::Unchanged);
        assert!(changes[0].precomputed_hash.is_none());
        assert_eq!(source.reads(), 1);
    }

    #[tokio::test]
    async fn mtime_drift_with_new_hash_is_modified_and_carries_hash() {
        let source = StubSource::new(&[("a.txt", b"world")]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[observed("a.txt", 5, 60)],
                &[record("a.txt", 5, 0, &hash_bytes(b"hello"), FileStatus::New)],
                &source,
            )
            .await;
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(
            changes[0].precomputed_hash.as_deref(),
            Some(hash_bytes(b"world").as_str())
        );
    }

    #[tokio::test]
    async fn read_failure_during_confirmation_is_modified() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[observed("a.txt", 5, 60)],
                &[record("a.txt", 5, 0, "h", FileStatus::New)],
                &source,
            )
            .await;
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert!(changes[0].precomputed_hash.is_none());
    }

    #[tokio::test]
    async fn tombstones_are_not_deleted_twice() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let prior = [record("d.txt", 4, 0, "h", FileStatus::Deleted)];
        for _ in 0..2 {
            let changes = detector.detect(&[], &prior, &source).await;
            assert!(changes.is_empty());
        }
    }

    #[tokio::test]
    async fn reappearing_tombstone_is_new_with_previous() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let changes = detector
            .detect(
                &[observed("d.txt", 4, 0)],
                &[record("d.txt", 4, 0, "h", FileStatus::Deleted)],
                &source,
            )
            .await;
        assert_eq!(changes[0].kind, ChangeKind::New);
        assert_eq!(
            changes[0].previous.as_ref().map(|p| p.identity.as_str()),
            Some("d.txt-id")
        );
    }

    #[tokio::test]
    async fn never_uploaded_error_record_is_retried_as_new() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let mut failed = record("e.txt", 4, 0, "", FileStatus::Error);
        failed.sink_location.clear();
        let changes = detector
            .detect(&[observed("e.txt", 4, 0)], &[failed], &source)
            .await;
        assert_eq!(changes[0].kind, ChangeKind::New);
    }

    #[tokio::test]
    async fn cancelled_detection_skips_confirmation_reads() {
        let source = StubSource::new(&[("a.txt", b"hello")]);
        let detector = ChangeDetector::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let changes = detector
            .detect_until(
                &[observed("a.txt", 5, 60)],
                &[record("a.txt", 5, 0, &hash_bytes(b"hello"), FileStatus::New)],
                &source,
                &cancel,
            )
            .await;
        assert!(changes.is_none());
        assert_eq!(source.reads(), 0);
    }

    #[tokio::test]
    async fn cancellation_does_not_matter_without_confirmation() {
        let source = StubSource::new(&[]);
        let detector = ChangeDetector::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let changes = detector
            .detect_until(
                &[observed("a.txt", 5, 0)],
                &[record("a.txt", 5, 0, "h", FileStatus::New)],
                &source,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(changes[0].kind, ChangeKind::Unchanged);
    }

    #[test]
    fn unknown_mtime_with_equal_size_is_unchanged() {
        let detector = ChangeDetector::default();
        let mut file = observed("a.txt", 5, 0);
        file.modified_at = None;
        let prev = record("a.txt", 5, 100, "h", FileStatus::New);
        assert_eq!(detector.compare_metadata(&file, &prev), Heuristic::Unchanged);
    }
}
