//! Filesystem source connector.
//!
//! Walks a local directory and reports every file matching the include
//! globs (minus the exclude globs) as an [`ObservedFile`]. URIs are paths
//! relative to the root with `/` separators, so they stay stable across
//! machines and platforms.
//!
//! # Configuration
//!
//! ```toml
//! [[knowledge_bases.docs.sources]]
//! source_id = "handbook"
//! source_type = "filesystem"
//! [knowledge_bases.docs.sources.config]
//! root = "./handbook"
//! include_globs = ["**/*.md", "**/*.pdf"]
//! exclude_globs = ["drafts/**"]
//! follow_symlinks = false
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use walkdir::WalkDir;

use crate::models::{ObservedFile, SourceDefinition};
use crate::traits::{ContentStream, Source};

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

/// A directory tree exposed as a [`Source`].
pub struct FilesystemSource {
    config: FilesystemSourceConfig,
    include: GlobSet,
    exclude: GlobSet,
}

impl FilesystemSource {
    pub fn new(config: FilesystemSourceConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            config,
            include,
            exclude,
        })
    }

    /// Constructor registered in [`SourceFactory`](crate::traits::SourceFactory).
    pub fn from_definition(definition: &SourceDefinition) -> Result<Box<dyn Source>> {
        let config: FilesystemSourceConfig =
            serde_json::from_value(definition.source_config.clone()).with_context(|| {
                format!(
                    "Invalid filesystem config for source '{}'",
                    definition.source_id
                )
            })?;
        Ok(Box::new(Self::new(config)?))
    }

    /// Resolve a URI back to a path under the root, rejecting escapes.
    fn resolve(&self, uri: &str) -> Result<PathBuf> {
        let relative = Path::new(uri);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid file uri: '{}'", uri);
        }
        Ok(self.config.root.join(relative))
    }

    fn scan(&self) -> Result<Vec<ObservedFile>> {
        let root = &self.config.root;
        let mut files = Vec::new();

        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let uri = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&uri) || !self.include.is_match(&uri) {
                continue;
            }

            let metadata = entry
                .metadata()
                .with_context(|| format!("Failed to stat {}", path.display()))?;

            files.push(ObservedFile {
                content_type: content_type_for(&uri).to_string(),
                size: metadata.len(),
                created_at: metadata.created().ok().map(to_utc),
                modified_at: metadata.modified().ok().map(to_utc),
                uri,
            });
        }

        files.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(files)
    }
}

#[async_trait]
impl Source for FilesystemSource {
    fn source_type(&self) -> &str {
        "filesystem"
    }

    async fn initialize(&self) -> Result<()> {
        let root = &self.config.root;
        if !root.is_dir() {
            bail!("Filesystem source root does not exist: {}", root.display());
        }
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<ObservedFile>> {
        let source = Self {
            config: self.config.clone(),
            include: self.include.clone(),
            exclude: self.exclude.clone(),
        };
        tokio::task::spawn_blocking(move || source.scan()).await?
    }

    async fn get_content(&self, uri: &str) -> Result<Vec<u8>> {
        let path = self.resolve(uri)?;
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))
    }

    async fn read_stream(&self, uri: &str) -> Result<ContentStream> {
        let path = self.resolve(uri)?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// MIME type by file extension.
fn content_type_for(uri: &str) -> &'static str {
    let ext = uri.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "md" | "markdown" => "text/markdown",
        "txt" => "text/plain",
        "json" => "application/json",
        "yaml" | "yml" => "text/yaml",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "pptx" => "application/vnd.openxmlformats-officedocument.presentationml.presentation",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
