//! In-memory [`Sink`] implementation (`type = "mock"`).
//!
//! Keeps documents in a `HashMap` behind a `tokio::sync::RwLock`, so it can
//! be shared by concurrent source tasks. Call counters and failure
//! injection make it the sink of choice for tests and dry runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{DocumentInfo, Metadata};
use crate::traits::{Sink, SinkConfig};

struct StoredDoc {
    identity: String,
    content: Vec<u8>,
    metadata: Metadata,
    updated_at: chrono::DateTime<Utc>,
}

/// In-memory sink for tests and dry runs.
#[derive(Default)]
pub struct MemorySink {
    docs: RwLock<HashMap<String, StoredDoc>>,
    fail_uris: RwLock<HashSet<String>>,
    fail_deletes: RwLock<bool>,
    uploads: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(_config: &SinkConfig) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(Self::new()))
    }

    /// Make uploads and updates fail for documents whose `original_uri`
    /// metadata equals `uri`.
    pub async fn fail_writes_for(&self, uri: &str) {
        self.fail_uris.write().await.insert(uri.to_string());
    }

    /// Make every delete fail.
    pub async fn fail_deletes(&self, fail: bool) {
        *self.fail_deletes.write().await = fail;
    }

    /// Undo every injected failure.
    pub async fn clear_failures(&self) {
        self.fail_uris.write().await.clear();
        *self.fail_deletes.write().await = false;
    }

    pub async fn content(&self, location: &str) -> Option<Vec<u8>> {
        self.docs
            .read()
            .await
            .get(location)
            .map(|d| d.content.clone())
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    async fn check_writable(&self, metadata: &Metadata) -> Result<()> {
        if let Some(uri) = metadata.get("original_uri") {
            if self.fail_uris.read().await.contains(uri) {
                bail!("injected write failure for '{}'", uri);
            }
        }
        Ok(())
    }
}

fn info(location: &str, doc: &StoredDoc) -> DocumentInfo {
    DocumentInfo {
        location: location.to_string(),
        identity: doc.identity.clone(),
        size: doc.content.len() as u64,
        metadata: doc.metadata.clone(),
        updated_at: doc.updated_at,
    }
}

#[async_trait]
impl Sink for MemorySink {
    fn sink_type(&self) -> &str {
        "mock"
    }

    async fn upload(&self, content: &[u8], identity: &str, metadata: &Metadata) -> Result<String> {
        self.check_writable(metadata).await?;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        let location = format!("mock://{}", identity);
        self.docs.write().await.insert(
            location.clone(),
            StoredDoc {
                identity: identity.to_string(),
                content: content.to_vec(),
                metadata: metadata.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(location)
    }

    async fn update(&self, location: &str, content: &[u8], metadata: &Metadata) -> Result<()> {
        self.check_writable(metadata).await?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut docs = self.docs.write().await;
        let Some(doc) = docs.get_mut(location) else {
            bail!("no document at {}", location);
        };
        doc.content = content.to_vec();
        doc.metadata = metadata.clone();
        doc.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, location: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_deletes.read().await {
            bail!("injected delete failure for {}", location);
        }
        self.docs.write().await.remove(location);
        Ok(())
    }

    async fn get_metadata(&self, location: &str) -> Result<Option<DocumentInfo>> {
        Ok(self
            .docs
            .read()
            .await
            .get(location)
            .map(|doc| info(location, doc)))
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<DocumentInfo>> {
        let docs = self.docs.read().await;
        let mut out: Vec<DocumentInfo> = docs
            .iter()
            .filter(|(location, _)| location.starts_with(prefix))
            .map(|(location, doc)| info(location, doc))
            .collect();
        out.sort_by(|a, b| a.location.cmp(&b.location));
        Ok(out)
    }
}
