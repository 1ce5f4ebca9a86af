//! # kb-sync
//!
//! An incremental sync and change-detection engine for knowledge bases.
//!
//! kb-sync mirrors files from pluggable sources (local directories, document
//! libraries, cloud drives) into a document sink. Every run compares what
//! each source currently lists against the file records persisted by the
//! previous run, and only touches the sink for files that are new, modified,
//! or gone. Every file keeps one stable identity for its whole life in the
//! sink.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────┐   ┌──────────────┐
//! │   Sources    │──▶│ ChangeDetector │──▶│     Sink     │
//! │ FS / custom  │   │ size·mtime·hash│   │ local / mock │
//! └──────────────┘   └───────┬────────┘   └──────────────┘
//!                            │
//!            SourceSyncUnit (one per source)
//!                            │
//!                 ┌──────────▼──────────┐   ┌──────────────┐
//!                 │  SyncOrchestrator   │──▶│  Repository  │
//!                 │ parallel/sequential │   │ SQLite / mem │
//!                 └─────────────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kbsync init                     # create database
//! kbsync sources docs             # show configured sources
//! kbsync sync docs                # sync every enabled source
//! kbsync sync docs --source wiki  # sync one source
//! kbsync runs docs                # recent run history
//! kbsync errors docs              # files whose last sync failed
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Source- and file-level error types |
//! | [`identity`] | Stable document identities and content hashing |
//! | [`detect`] | Tiered change detection |
//! | [`traits`] | Source and sink traits, plus their factories |
//! | [`connector_fs`] | Filesystem source |
//! | [`sink_local`] | Local-directory sink |
//! | [`sink_memory`] | In-memory sink for tests and dry runs |
//! | [`repository`] | Persistence trait and in-memory repository |
//! | [`sqlite_repo`] | SQLite repository |
//! | [`source_sync`] | Per-source sync unit |
//! | [`orchestrator`] | Multi-source runs |
//! | [`progress`] | Progress reporting on stderr |
//! | [`report`] | CLI tables and summaries |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod connector_fs;
pub mod db;
pub mod detect;
pub mod error;
pub mod identity;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod repository;
pub mod sink_local;
pub mod sink_memory;
pub mod source_sync;
pub mod sqlite_repo;
pub mod traits;

pub use detect::ChangeDetector;
pub use error::{FileError, SourceError, SourceFailure};
pub use identity::{assign_identity, Identity};
pub use models::{
    ChangeKind, FileRecord, FileStatus, ObservedFile, RunStatus, SourceDefinition, SourceStats,
    SyncMode, SyncRun,
};
pub use orchestrator::{SyncOptions, SyncOrchestrator};
pub use repository::{InMemoryRepository, Repository};
pub use source_sync::SourceSyncUnit;
pub use traits::{Sink, SinkConfig, SinkFactory, Source, SourceFactory};
