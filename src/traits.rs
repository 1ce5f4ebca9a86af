//! Capability traits for sources and sinks, and the registries that build them.
//!
//! The engine never knows which concrete connector it talks to. A source is
//! anything that can list files and hand out their bytes; a sink is anything
//! that can store, replace, and remove documents. Both are created by type
//! string through a factory, so adding a connector means registering one
//! constructor.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────┐        ┌──────────────────────────┐
//! │      SourceFactory       │        │       SinkFactory        │
//! │  filesystem │ custom … │        │   local │ mock │ custom  │
//! └─────────────┬────────────┘        └─────────────┬────────────┘
//!               ▼                                   ▼
//!        Box<dyn Source>  ──▶ SourceSyncUnit ──▶ Arc<dyn Sink>
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncRead;

use crate::models::{DocumentInfo, Metadata, ObservedFile, SourceDefinition};

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

/// A byte stream over one file's content.
pub type ContentStream = Box<dyn AsyncRead + Send + Unpin>;

/// A document source: file system, document library, cloud drive.
///
/// # Lifecycle
///
/// 1. [`initialize`](Source::initialize) to connect and authenticate.
/// 2. [`list_files`](Source::list_files) to report every file currently present.
/// 3. [`get_content`](Source::get_content) / [`read_stream`](Source::read_stream)
///    for files the engine decides to read.
/// 4. [`cleanup`](Source::cleanup) is always called, on success and failure.
///
/// Errors from `initialize` and `list_files` are fatal for the source.
/// Errors from content reads only affect the file being read.
#[async_trait]
pub trait Source: Send + Sync {
    /// Connector type identifier (e.g. `"filesystem"`).
    fn source_type(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<ObservedFile>>;

    async fn get_content(&self, uri: &str) -> Result<Vec<u8>>;

    /// Stream a file's content for hashing.
    ///
    /// Defaults to buffering [`get_content`](Source::get_content); connectors
    /// with a native streaming API should override it.
    async fn read_stream(&self, uri: &str) -> Result<ContentStream> {
        let content = self.get_content(uri).await?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Constructor registered under a source type string.
///
/// Closures may capture shared state, such as a client pool or credentials
/// resolved once by the host.
pub type SourceConstructor =
    Arc<dyn Fn(&SourceDefinition) -> Result<Box<dyn Source>> + Send + Sync>;

/// Registry of source constructors keyed by `source_type`.
///
/// # Example
///
/// ```rust
/// use kb_sync::traits::SourceFactory;
///
/// let sources = SourceFactory::with_builtins();
/// assert!(sources.supports("filesystem"));
/// ```
#[derive(Clone)]
pub struct SourceFactory {
    constructors: BTreeMap<String, SourceConstructor>,
}

impl SourceFactory {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Create a factory pre-loaded with the built-in connectors.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("filesystem", crate::connector_fs::FilesystemSource::from_definition);
        factory
    }

    /// Register (or replace) the constructor for `source_type`.
    pub fn register<F>(&mut self, source_type: &str, constructor: F)
    where
        F: Fn(&SourceDefinition) -> Result<Box<dyn Source>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(source_type.to_string(), Arc::new(constructor));
    }

    pub fn supports(&self, source_type: &str) -> bool {
        self.constructors.contains_key(source_type)
    }

    pub fn source_types(&self) -> Vec<&str> {
        self.constructors.keys().map(|k| k.as_str()).collect()
    }

    /// Build the connector for `definition`.
    ///
    /// Returns `Ok(None)` when no constructor is registered for its type.
    pub fn create(&self, definition: &SourceDefinition) -> Result<Option<Box<dyn Source>>> {
        match self.constructors.get(&definition.source_type) {
            Some(constructor) => constructor(definition).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for SourceFactory {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════

/// A RAG storage backend.
///
/// One sink instance is shared by every source of a run. Implementations
/// must be safe to call concurrently, or serialize calls internally.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Backend type identifier (e.g. `"local"`).
    fn sink_type(&self) -> &str;

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    /// Store a new document under `identity`, returning its location.
    async fn upload(&self, content: &[u8], identity: &str, metadata: &Metadata) -> Result<String>;

    /// Replace the document at `location`.
    async fn update(&self, location: &str, content: &[u8], metadata: &Metadata) -> Result<()>;

    async fn delete(&self, location: &str) -> Result<()>;

    async fn get_metadata(&self, location: &str) -> Result<Option<DocumentInfo>>;

    async fn list_documents(&self, prefix: &str) -> Result<Vec<DocumentInfo>>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

/// Sink settings of a knowledge base: a type string plus opaque options.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: String,
    #[serde(flatten)]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl SinkConfig {
    pub fn new(sink_type: &str) -> Self {
        Self {
            sink_type: sink_type.to_string(),
            options: serde_json::Map::new(),
        }
    }
}

/// Constructor registered under a sink type string.
pub type SinkConstructor = Arc<dyn Fn(&SinkConfig) -> Result<Arc<dyn Sink>> + Send + Sync>;

/// Registry of sink constructors keyed by sink type.
#[derive(Clone)]
pub struct SinkFactory {
    constructors: BTreeMap<String, SinkConstructor>,
}

impl SinkFactory {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Create a factory pre-loaded with the `local` and `mock` sinks.
    pub fn with_builtins() -> Self {
        let mut factory = Self::new();
        factory.register("local", crate::sink_local::LocalSink::from_config);
        factory.register("mock", crate::sink_memory::MemorySink::from_config);
        factory
    }

    pub fn register<F>(&mut self, sink_type: &str, constructor: F)
    where
        F: Fn(&SinkConfig) -> Result<Arc<dyn Sink>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(sink_type.to_string(), Arc::new(constructor));
    }

    pub fn supports(&self, sink_type: &str) -> bool {
        self.constructors.contains_key(sink_type)
    }

    pub fn create(&self, config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        match self.constructors.get(&config.sink_type) {
            Some(constructor) => constructor(config),
            None => anyhow::bail!(
                "Unknown sink type: '{}'. Available: {}",
                config.sink_type,
                self.constructors
                    .keys()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl Default for SinkFactory {
    fn default() -> Self {
        Self::new()
    }
}
