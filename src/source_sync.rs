//! Per-source synchronization.
//!
//! A [`SourceSyncUnit`] drives one source end to end:
//!
//! ```text
//! initialize → list → detect → for each change: read → identify → sink → record
//!                                                                   cleanup (always)
//! ```
//!
//! Failures are contained at two levels. Anything that goes wrong while
//! applying a single change becomes an `error` file record and an `errors`
//! count; the loop moves on. Failures to initialize or list the source, or
//! cancellation, end this source with a [`SourceFailure`] carrying the
//! counts gathered so far.

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::detect::ChangeDetector;
use crate::error::{FileError, SourceError, SourceFailure};
use crate::identity::{assign_identity, hash_bytes};
use crate::models::{
    Change, ChangeKind, FileRecord, FileStatus, Metadata, ObservedFile, SourceDefinition,
    SourceStats,
};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::repository::Repository;
use crate::traits::{Sink, Source};

/// Syncs one source of one knowledge base into a sink.
pub struct SourceSyncUnit<'a> {
    knowledge_base: &'a str,
    definition: &'a SourceDefinition,
    repository: &'a dyn Repository,
    detector: &'a ChangeDetector,
    progress: &'a dyn SyncProgressReporter,
    cancel: CancellationToken,
}

impl<'a> SourceSyncUnit<'a> {
    pub fn new(
        knowledge_base: &'a str,
        definition: &'a SourceDefinition,
        repository: &'a dyn Repository,
        detector: &'a ChangeDetector,
    ) -> Self {
        Self {
            knowledge_base,
            definition,
            repository,
            detector,
            progress: &NoProgress,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: &'a dyn SyncProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    /// Stop at the next read or change boundary once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn source_id(&self) -> &str {
        &self.definition.source_id
    }

    /// Sync `source` into `sink` given the source's prior file records.
    ///
    /// `cleanup` runs on the source whether or not the sync succeeded.
    pub async fn sync(
        &self,
        source: &dyn Source,
        sink: &dyn Sink,
        prior: &[FileRecord],
    ) -> Result<SourceStats, SourceFailure> {
        self.progress.report(SyncProgressEvent::Discovering {
            source: self.source_id().to_string(),
        });

        let result = self.run(source, sink, prior).await;

        if let Err(e) = source.cleanup().await {
            tracing::warn!(
                source_id = %self.source_id(),
                error = %format!("{:#}", e),
                "source cleanup failed"
            );
        }

        let (stats, error) = match &result {
            Ok(stats) => (*stats, None),
            Err(failure) => (failure.stats, Some(failure.error.to_string())),
        };
        self.progress.report(SyncProgressEvent::Finished {
            source: self.source_id().to_string(),
            stats,
            error,
        });

        result
    }

    async fn run(
        &self,
        source: &dyn Source,
        sink: &dyn Sink,
        prior: &[FileRecord],
    ) -> Result<SourceStats, SourceFailure> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SourceError::Cancelled.into()),
            r = source.initialize() => r.map_err(SourceError::Initialize)?,
        }

        let observed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SourceError::Cancelled.into()),
            r = source.list_files() => r.map_err(SourceError::List)?,
        };

        let Some(changes) = self
            .detector
            .detect_until(&observed, prior, source, &self.cancel)
            .await
        else {
            tracing::warn!(
                source_id = %self.source_id(),
                observed = observed.len(),
                "cancelled during change detection"
            );
            return Err(SourceError::Cancelled.into());
        };
        tracing::info!(
            source_id = %self.source_id(),
            observed = observed.len(),
            changes = changes.len(),
            "listed source"
        );

        let mut stats = SourceStats::default();
        let total = changes.len() as u64;

        for change in &changes {
            if self.cancel.is_cancelled() {
                tracing::warn!(
                    source_id = %self.source_id(),
                    processed = stats.processed,
                    total,
                    "cancelled mid-source"
                );
                return Err(SourceFailure::new(SourceError::Cancelled, stats));
            }

            match self.apply(source, sink, change).await {
                Ok(record) => {
                    tracing::debug!(uri = %change.uri, status = %record.status, "applied change");
                    match change.kind {
                        ChangeKind::New => stats.new += 1,
                        ChangeKind::Modified => stats.modified += 1,
                        ChangeKind::Unchanged => stats.unchanged += 1,
                        ChangeKind::Deleted => stats.deleted += 1,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        source_id = %self.source_id(),
                        uri = %change.uri,
                        error = %e,
                        "file failed"
                    );
                    stats.errors += 1;
                    let record = self.error_record(change, &e);
                    if let Err(persist) = self.repository.upsert_file_record(&record).await {
                        tracing::error!(
                            uri = %change.uri,
                            error = %format!("{:#}", persist),
                            "failed to persist error record"
                        );
                    }
                }
            }
            stats.processed += 1;

            self.progress.report(SyncProgressEvent::Processing {
                source: self.source_id().to_string(),
                n: stats.processed,
                total,
            });
        }

        Ok(stats)
    }

    /// Apply one change to the sink and persist the resulting record.
    async fn apply(
        &self,
        source: &dyn Source,
        sink: &dyn Sink,
        change: &Change,
    ) -> Result<FileRecord, FileError> {
        let record = match (change.kind, change.observed.as_ref()) {
            (ChangeKind::New | ChangeKind::Modified, Some(observed)) => {
                self.write_document(source, sink, change, observed).await?
            }
            (ChangeKind::Unchanged, Some(observed)) => self.refresh(change, observed),
            (_, _) => self.tombstone(sink, change).await,
        };

        self.repository
            .upsert_file_record(&record)
            .await
            .map_err(|source| FileError::Persist {
                uri: change.uri.clone(),
                source,
            })?;

        Ok(record)
    }

    async fn write_document(
        &self,
        source: &dyn Source,
        sink: &dyn Sink,
        change: &Change,
        observed: &ObservedFile,
    ) -> Result<FileRecord, FileError> {
        let content = source
            .get_content(&change.uri)
            .await
            .map_err(|source| FileError::Read {
                uri: change.uri.clone(),
                source,
            })?;

        // The stored hash must describe the bytes the sink receives.
        let file_hash = hash_bytes(&content);
        if let Some(confirmed) = &change.precomputed_hash {
            if *confirmed != file_hash {
                tracing::debug!(uri = %change.uri, "content changed since detection");
            }
        }

        let existing = change
            .previous
            .as_ref()
            .map(|p| p.identity.as_str())
            .filter(|id| !id.is_empty());
        let identity = assign_identity(&self.definition.qualified_uri(&change.uri), existing);
        if !identity.deterministic {
            tracing::warn!(uri = %change.uri, identity = %identity.name, "non-deterministic identity");
        }

        let metadata = self.request_metadata(observed, &file_hash);

        let (location, status) = match change.kind {
            ChangeKind::Modified => {
                let location = change
                    .previous
                    .as_ref()
                    .map(|p| p.sink_location.clone())
                    .filter(|l| !l.is_empty())
                    .ok_or_else(|| FileError::MissingLocation(change.uri.clone()))?;
                sink.update(&location, &content, &metadata)
                    .await
                    .map_err(|source| FileError::Update {
                        uri: change.uri.clone(),
                        location: location.clone(),
                        source,
                    })?;
                (location, FileStatus::Modified)
            }
            _ => {
                let location = sink
                    .upload(&content, &identity.name, &metadata)
                    .await
                    .map_err(|source| FileError::Upload {
                        uri: change.uri.clone(),
                        source,
                    })?;
                (location, FileStatus::New)
            }
        };

        let now = Utc::now();
        Ok(FileRecord {
            knowledge_base: self.knowledge_base.to_string(),
            source_id: self.source_id().to_string(),
            original_uri: change.uri.clone(),
            file_hash,
            identity: identity.name,
            sink_location: location,
            status,
            size: observed.size,
            source_created_at: observed.created_at,
            source_modified_at: observed.modified_at,
            error_message: None,
            source_metadata: metadata,
            created_at: change.previous.as_ref().map_or(now, |p| p.created_at),
            updated_at: now,
        })
    }

    /// Unchanged files only get their status and observed metadata refreshed,
    /// so a confirmed mtime drift is not re-hashed next run.
    fn refresh(&self, change: &Change, observed: &ObservedFile) -> FileRecord {
        let now = Utc::now();
        match &change.previous {
            Some(previous) => {
                let mut record = previous.clone();
                record.status = FileStatus::Unchanged;
                record.error_message = None;
                record.size = observed.size;
                record.source_modified_at = observed.modified_at.or(previous.source_modified_at);
                record.updated_at = now;
                record
            }
            None => self.blank_record(&change.uri, Some(observed), FileStatus::Unchanged),
        }
    }

    /// Best-effort sink delete; the record is tombstoned either way.
    async fn tombstone(&self, sink: &dyn Sink, change: &Change) -> FileRecord {
        let Some(previous) = &change.previous else {
            return self.blank_record(&change.uri, None, FileStatus::Deleted);
        };

        if previous.has_location() {
            if let Err(e) = sink.delete(&previous.sink_location).await {
                tracing::warn!(
                    source_id = %self.source_id(),
                    uri = %change.uri,
                    location = %previous.sink_location,
                    error = %format!("{:#}", e),
                    "sink delete failed, marking deleted anyway"
                );
            }
        }

        let mut record = previous.clone();
        record.status = FileStatus::Deleted;
        record.error_message = None;
        record.updated_at = Utc::now();
        record
    }

    /// Record for a failed change.
    ///
    /// Keeps the last good hash and observed metadata when the sink still
    /// holds a synced copy, so the next run compares against that copy.
    /// Otherwise the hash is cleared and the file is retried as new.
    fn error_record(&self, change: &Change, error: &FileError) -> FileRecord {
        let mut record = match &change.previous {
            Some(previous) => {
                let mut record = previous.clone();
                if previous.status == FileStatus::Deleted {
                    record.file_hash.clear();
                }
                record
            }
            None => {
                let mut record =
                    self.blank_record(&change.uri, change.observed.as_ref(), FileStatus::Error);
                record.identity =
                    assign_identity(&self.definition.qualified_uri(&change.uri), None).name;
                record
            }
        };
        record.status = FileStatus::Error;
        record.error_message = Some(error.to_string());
        record.updated_at = Utc::now();
        record
    }

    fn blank_record(
        &self,
        uri: &str,
        observed: Option<&ObservedFile>,
        status: FileStatus,
    ) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            knowledge_base: self.knowledge_base.to_string(),
            source_id: self.source_id().to_string(),
            original_uri: uri.to_string(),
            file_hash: String::new(),
            identity: String::new(),
            sink_location: String::new(),
            status,
            size: observed.map_or(0, |o| o.size),
            source_created_at: observed.and_then(|o| o.created_at),
            source_modified_at: observed.and_then(|o| o.modified_at),
            error_message: None,
            source_metadata: self.definition.metadata_tags.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sink metadata: the source's tags, overridden by the engine's own keys.
    fn request_metadata(&self, observed: &ObservedFile, file_hash: &str) -> Metadata {
        let mut metadata = self.definition.metadata_tags.clone();
        metadata.insert("source_id".to_string(), self.source_id().to_string());
        metadata.insert(
            "source_type".to_string(),
            self.definition.source_type.clone(),
        );
        metadata.insert("original_uri".to_string(), observed.uri.clone());
        metadata.insert("file_hash".to_string(), file_hash.to_string());
        metadata.insert("content_type".to_string(), observed.content_type.clone());
        metadata.insert(
            "source_modified_at".to_string(),
            observed
                .modified_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        );
        metadata
    }
}
