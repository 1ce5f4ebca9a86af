//! Local-directory [`Sink`] implementation (`type = "local"`).
//!
//! Each document is written to `<root>/<prefix><identity>` with a
//! `<identity>.meta.json` sidecar holding its metadata. Writes go to a
//! `.tmp` file first and are renamed into place, so a crash never leaves a
//! half-written document behind.
//!
//! # Configuration
//!
//! ```toml
//! [knowledge_bases.docs.sink]
//! type = "local"
//! root = "./data/sink"
//! prefix = "docs/"
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{DocumentInfo, Metadata};
use crate::traits::{Sink, SinkConfig};

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Deserialize, Clone)]
pub struct LocalSinkConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sidecar {
    identity: String,
    metadata: Metadata,
    updated_at: DateTime<Utc>,
}

/// A directory used as a document store.
pub struct LocalSink {
    config: LocalSinkConfig,
}

impl LocalSink {
    pub fn new(config: LocalSinkConfig) -> Self {
        Self { config }
    }

    pub fn from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        let parsed: LocalSinkConfig =
            serde_json::from_value(serde_json::Value::Object(config.options.clone()))
                .context("Invalid local sink config")?;
        Ok(Arc::new(Self::new(parsed)))
    }

    fn path_for(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        if location.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid sink location: '{}'", location);
        }
        Ok(self.config.root.join(relative))
    }

    async fn write_document(
        &self,
        location: &str,
        identity: &str,
        content: &[u8],
        metadata: &Metadata,
    ) -> Result<()> {
        let path = self.path_for(location)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        write_atomic(&path, content).await?;

        let sidecar = Sidecar {
            identity: identity.to_string(),
            metadata: metadata.clone(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&sidecar)?;
        write_atomic(&sidecar_path(&path), &json).await
    }

    async fn read_info(&self, location: &str) -> Result<Option<DocumentInfo>> {
        let path = self.path_for(location)?;
        let size = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat {}", path.display())),
        };

        let sidecar_file = sidecar_path(&path);
        let raw = tokio::fs::read(&sidecar_file)
            .await
            .with_context(|| format!("Failed to read {}", sidecar_file.display()))?;
        let sidecar: Sidecar = serde_json::from_slice(&raw)
            .with_context(|| format!("Corrupt sidecar {}", sidecar_file.display()))?;

        Ok(Some(DocumentInfo {
            location: location.to_string(),
            identity: sidecar.identity,
            size,
            metadata: sidecar.metadata,
            updated_at: sidecar.updated_at,
        }))
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(META_SUFFIX);
    PathBuf::from(name)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {}", tmp.display()))?;
    Ok(())
}

#[async_trait]
impl Sink for LocalSink {
    fn sink_type(&self) -> &str {
        "local"
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.root)
            .await
            .with_context(|| format!("Failed to create sink root {}", self.config.root.display()))
    }

    async fn upload(&self, content: &[u8], identity: &str, metadata: &Metadata) -> Result<String> {
        let location = format!("{}{}", self.config.prefix, identity);
        self.write_document(&location, identity, content, metadata)
            .await?;
        Ok(location)
    }

    async fn update(&self, location: &str, content: &[u8], metadata: &Metadata) -> Result<()> {
        let Some(existing) = self.read_info(location).await? else {
            bail!("No document at {}", location);
        };
        self.write_document(location, &existing.identity, content, metadata)
            .await
    }

    async fn delete(&self, location: &str) -> Result<()> {
        let path = self.path_for(location)?;
        for p in [sidecar_path(&path), path] {
            match tokio::fs::remove_file(&p).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete {}", p.display()))
                }
            }
        }
        Ok(())
    }

    async fn get_metadata(&self, location: &str) -> Result<Option<DocumentInfo>> {
        self.read_info(location).await
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<DocumentInfo>> {
        let root = self.config.root.clone();
        let locations = tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut out = Vec::new();
            if !root.is_dir() {
                return Ok(out);
            }
            for entry in walkdir::WalkDir::new(&root) {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                let location = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if location.ends_with(META_SUFFIX) || location.ends_with(".tmp") {
                    continue;
                }
                out.push(location);
            }
            Ok(out)
        })
        .await??;

        let mut docs = Vec::new();
        for location in locations.iter().filter(|l| l.starts_with(prefix)) {
            if let Some(info) = self.read_info(location).await? {
                docs.push(info);
            }
        }
        docs.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(docs)
    }
}
