//! TOML configuration for the `kbsync` host.
//!
//! ```toml
//! [db]
//! path = "./data/kbsync.sqlite"
//!
//! [sync]
//! mode = "parallel"
//! max_concurrency = 8
//! deadline_secs = 3600
//! mtime_tolerance_secs = 2
//!
//! [knowledge_bases.docs.sink]
//! type = "local"
//! root = "./data/sink"
//!
//! [[knowledge_bases.docs.sources]]
//! source_id = "handbook"
//! source_type = "filesystem"
//! metadata_tags = { team = "platform" }
//! [knowledge_bases.docs.sources.config]
//! root = "./handbook"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::models::{SourceDefinition, SyncMode};
use crate::orchestrator::SyncOptions;
use crate::traits::SinkConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub knowledge_bases: BTreeMap<String, KnowledgeBaseConfig>,
}

/// Pool size used when `db.max_connections` is not set.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_mtime_tolerance")]
    pub mtime_tolerance_secs: u64,
}

fn default_mtime_tolerance() -> u64 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Parallel,
            max_concurrency: None,
            deadline_secs: None,
            mtime_tolerance_secs: default_mtime_tolerance(),
        }
    }
}

impl SyncConfig {
    /// Run options derived from this section, before CLI overrides.
    pub fn options(&self) -> SyncOptions {
        SyncOptions {
            mode: self.mode,
            max_concurrency: self.max_concurrency,
            deadline: self.deadline_secs.map(Duration::from_secs),
            source_filter: None,
        }
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_secs(self.mtime_tolerance_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct KnowledgeBaseConfig {
    pub sink: SinkConfig,
    #[serde(default)]
    pub sources: Vec<SourceDefinition>,
}

impl Config {
    pub fn knowledge_base(&self, name: &str) -> Result<&KnowledgeBaseConfig> {
        self.knowledge_bases.get(name).with_context(|| {
            format!(
                "Unknown knowledge base: '{}'. Configured: {}",
                name,
                self.knowledge_bases
                    .keys()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }

    if config.sync.max_concurrency == Some(0) {
        anyhow::bail!("sync.max_concurrency must be > 0");
    }

    if config.sync.deadline_secs == Some(0) {
        anyhow::bail!("sync.deadline_secs must be > 0");
    }

    for (name, kb) in &config.knowledge_bases {
        let mut seen = HashSet::new();
        for source in &kb.sources {
            if source.source_id.trim().is_empty() {
                anyhow::bail!("knowledge_bases.{}: source_id must not be empty", name);
            }
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!(
                    "knowledge_bases.{}: duplicate source_id '{}'",
                    name,
                    source.source_id
                );
            }
        }
    }

    Ok(config)
}
