//! Core data models used throughout the sync engine.
//!
//! These types describe what a source reports ([`ObservedFile`]), what the
//! engine remembers between runs ([`FileRecord`]), how a file changed
//! ([`Change`]), and what a run achieved ([`SyncRun`], [`SourceStats`]).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key/value metadata attached to documents in the sink.
pub type Metadata = BTreeMap<String, String>;

/// One configured source of a knowledge base.
///
/// Supplied by configuration and immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDefinition {
    /// Unique within a knowledge base.
    pub source_id: String,
    /// Connector type string resolved through the source factory.
    pub source_type: String,
    /// Connector-specific settings, opaque to the engine.
    #[serde(default, rename = "config")]
    pub source_config: serde_json::Value,
    /// Merged into the metadata of every document uploaded from this source.
    #[serde(default)]
    pub metadata_tags: Metadata,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl SourceDefinition {
    pub fn new(source_id: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            source_type: source_type.into(),
            source_config: serde_json::Value::Null,
            metadata_tags: Metadata::new(),
            enabled: true,
        }
    }

    /// Fully qualified URI of a file in this source, used to derive identities.
    ///
    /// Two sources sharing a sink can report the same relative `uri`; the
    /// source id keeps their identities apart.
    pub fn qualified_uri(&self, uri: &str) -> String {
        format!("{}:{}", self.source_id, uri)
    }
}

/// A file as reported by a source listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedFile {
    /// Source-relative identifier, stable across runs.
    pub uri: String,
    pub size: u64,
    pub content_type: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Lifecycle status of a [`FileRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    New,
    Modified,
    Unchanged,
    Deleted,
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "new",
            FileStatus::Modified => "modified",
            FileStatus::Unchanged => "unchanged",
            FileStatus::Deleted => "deleted",
            FileStatus::Error => "error",
        }
    }

    /// Active records are the ones whose content currently lives in the sink.
    pub fn is_active(&self) -> bool {
        !matches!(self, FileStatus::Deleted | FileStatus::Error)
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(FileStatus::New),
            "modified" => Ok(FileStatus::Modified),
            "unchanged" => Ok(FileStatus::Unchanged),
            "deleted" => Ok(FileStatus::Deleted),
            "error" => Ok(FileStatus::Error),
            other => anyhow::bail!("unknown file status: '{}'", other),
        }
    }
}

/// Durable per-file state, keyed by `(knowledge_base, source_id, original_uri)`.
///
/// `identity` and `sink_location` never change once assigned; later updates
/// touch the hash, status, and timestamps only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub knowledge_base: String,
    pub source_id: String,
    pub original_uri: String,
    /// Hex SHA-256 of the last successfully synced content. Empty if never synced.
    pub file_hash: String,
    pub identity: String,
    /// Empty until the first successful upload.
    pub sink_location: String,
    pub status: FileStatus,
    pub size: u64,
    pub source_created_at: Option<DateTime<Utc>>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub source_metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Whether the sink ever received this file.
    pub fn has_location(&self) -> bool {
        !self.sink_location.is_empty()
    }
}

/// Classification of a file relative to its prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    New,
    Modified,
    Unchanged,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::New => "new",
            ChangeKind::Modified => "modified",
            ChangeKind::Unchanged => "unchanged",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Transient result of change detection for one `uri`.
#[derive(Debug, Clone)]
pub struct Change {
    pub uri: String,
    pub kind: ChangeKind,
    /// Absent for [`ChangeKind::Deleted`].
    pub observed: Option<ObservedFile>,
    /// Absent for [`ChangeKind::New`], except when a tombstoned or
    /// never-uploaded record reappears.
    pub previous: Option<FileRecord>,
    /// Set when the detector already hashed the content to confirm a modification.
    pub precomputed_hash: Option<String>,
}

/// Per-source counters, owned by one source sync and merged at finalization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub processed: u64,
    pub new: u64,
    pub modified: u64,
    pub unchanged: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl SourceStats {
    pub fn merge(&mut self, other: &SourceStats) {
        self.processed += other.processed;
        self.new += other.new;
        self.modified += other.modified;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
        self.errors += other.errors;
    }
}

/// Execution policy for multi-source runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    #[default]
    Parallel,
    Sequential,
}

impl SyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::Parallel => "parallel",
            SyncMode::Sequential => "sequential",
        }
    }
}

impl FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(SyncMode::Parallel),
            "sequential" => Ok(SyncMode::Sequential),
            other => anyhow::bail!(
                "unknown sync mode: '{}'. Must be parallel or sequential.",
                other
            ),
        }
    }
}

/// Run lifecycle: `Running` → `Completed | Failed`, terminal once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: '{}'", other),
        }
    }
}

/// One execution of the orchestrator over a knowledge base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: i64,
    pub knowledge_base: String,
    pub mode: SyncMode,
    pub status: RunStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub totals: SourceStats,
    pub error_message: Option<String>,
    /// Every source attempted in this run, in configuration order.
    pub sources_processed: Vec<String>,
    pub per_source_stats: BTreeMap<String, SourceStats>,
    /// Fatal error per failed source.
    pub source_errors: BTreeMap<String, String>,
}

impl SyncRun {
    pub fn start(id: i64, knowledge_base: &str, mode: SyncMode, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            knowledge_base: knowledge_base.to_string(),
            mode,
            status: RunStatus::Running,
            start_time,
            end_time: None,
            totals: SourceStats::default(),
            error_message: None,
            sources_processed: Vec::new(),
            per_source_stats: BTreeMap::new(),
            source_errors: BTreeMap::new(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status != RunStatus::Running
    }
}

/// Document description returned by a sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub location: String,
    pub identity: String,
    pub size: u64,
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            FileStatus::New,
            FileStatus::Modified,
            FileStatus::Unchanged,
            FileStatus::Deleted,
            FileStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<FileStatus>().unwrap(), status);
        }
        assert!("gone".parse::<FileStatus>().is_err());
    }

    #[test]
    fn only_synced_statuses_are_active() {
        assert!(FileStatus::New.is_active());
        assert!(FileStatus::Unchanged.is_active());
        assert!(!FileStatus::Deleted.is_active());
        assert!(!FileStatus::Error.is_active());
    }

    #[test]
    fn stats_merge_adds_every_counter() {
        let mut total = SourceStats {
            processed: 3,
            new: 1,
            modified: 1,
            unchanged: 1,
            deleted: 0,
            errors: 0,
        };
        total.merge(&SourceStats {
            processed: 2,
            new: 0,
            modified: 0,
            unchanged: 0,
            deleted: 1,
            errors: 1,
        });
        assert_eq!(total.processed, 5);
        assert_eq!(total.deleted, 1);
        assert_eq!(total.errors, 1);
    }

    #[test]
    fn source_definition_defaults() {
        let def: SourceDefinition = toml::from_str(
            r#"
source_id = "handbook"
source_type = "filesystem"
"#,
        )
        .unwrap();
        assert!(def.enabled);
        assert!(def.metadata_tags.is_empty());
        assert_eq!(def.qualified_uri("a/b.md"), "handbook:a/b.md");
    }
}
