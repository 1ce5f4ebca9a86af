//! Error taxonomy of the sync engine.
//!
//! Collaborators (sources, sinks, repositories) report failures as
//! [`anyhow::Error`]. The engine sorts them into two classes:
//!
//! - [`SourceError`]: fatal for one source; escalates to the orchestrator,
//!   which records it in the run without touching sibling sources.
//! - [`FileError`]: fatal for one file; recorded as an `error` file record
//!   and counted, while the source moves on to the next change.

use thiserror::Error;

use crate::models::SourceStats;

/// A failure that stops processing of one source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unknown source type '{0}'")]
    UnknownSourceType(String),

    #[error("failed to initialize source: {0:#}")]
    Initialize(#[source] anyhow::Error),

    #[error("failed to list files: {0:#}")]
    List(#[source] anyhow::Error),

    #[error("failed to load prior file records: {0:#}")]
    PriorState(#[source] anyhow::Error),

    #[error("sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("cancelled before completion")]
    Cancelled,

    #[error("sync task panicked: {0}")]
    Panicked(String),
}

/// A fatal source error together with whatever was processed before it hit.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SourceFailure {
    #[source]
    pub error: SourceError,
    pub stats: SourceStats,
}

impl SourceFailure {
    pub fn new(error: SourceError, stats: SourceStats) -> Self {
        Self { error, stats }
    }
}

impl From<SourceError> for SourceFailure {
    fn from(error: SourceError) -> Self {
        Self {
            error,
            stats: SourceStats::default(),
        }
    }
}

/// A failure while applying a single change.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to read '{uri}': {source:#}")]
    Read {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to upload '{uri}': {source:#}")]
    Upload {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to update '{uri}' at {location}: {source:#}")]
    Update {
        uri: String,
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("modified file '{0}' has no sink location")]
    MissingLocation(String),

    #[error("failed to persist record for '{uri}': {source:#}")]
    Persist {
        uri: String,
        #[source]
        source: anyhow::Error,
    },
}
