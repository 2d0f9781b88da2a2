//! Registry of indexed sources.
//!
//! Kept in a `DashMap` and mirrored to a JSON file so listings survive a
//! restart. Persistence is best effort and happens in the background: a
//! failed load or save is logged and the in-memory registry stays
//! authoritative.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    pub source: String,
    pub chunks: usize,
    pub size_bytes: usize,
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SourceRecord {
    pub fn new(source: impl Into<String>, chunks: usize, size_bytes: usize) -> Self {
        Self {
            source: source.into(),
            chunks,
            size_bytes,
            indexed_at: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

pub struct SourceRegistry {
    entries: DashMap<String, SourceRecord>,
    path: Option<PathBuf>,
    /// Bumped on every change; a snapshot is only written if it is newer
    /// than the last one on disk
    version: AtomicU64,
    /// Version last written, held while writing
    written: Arc<Mutex<u64>>,
}

impl SourceRegistry {
    fn with_path(path: Option<PathBuf>) -> Self {
        Self {
            entries: DashMap::new(),
            path,
            version: AtomicU64::new(0),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn in_memory() -> Self {
        Self::with_path(None)
    }

    /// Open the registry backed by `path`, starting empty when the file is
    /// missing or unreadable
    pub async fn load(path: Option<PathBuf>) -> Self {
        let registry = Self::with_path(path);

        if let Some(path) = &registry.path {
            match read_records(path).await {
                Ok(records) => {
                    debug!(path = %path.display(), sources = records.len(), "Loaded source registry");
                    for (source, record) in records {
                        registry.entries.insert(source, record);
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Could not load source registry"),
            }
        }

        registry
    }

    pub fn add(&self, record: SourceRecord) {
        self.entries.insert(record.source.clone(), record);
        self.persist();
    }

    /// Returns whether the source was registered
    pub fn remove(&self, source: &str) -> bool {
        let removed = self.entries.remove(source).is_some();
        if removed {
            self.persist();
        }
        removed
    }

    /// Newest first
    pub fn list(&self) -> Vec<SourceRecord> {
        let mut records: Vec<SourceRecord> = self.entries.iter().map(|e| e.value().clone()).collect();
        records.sort_by(|a, b| b.indexed_at.cmp(&a.indexed_at).then_with(|| a.source.cmp(&b.source)));
        records
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Write the current state now, waiting for any background write
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut written = self.written.lock().await;
        let version = self.version.load(Ordering::SeqCst);
        write_records(path, &self.snapshot()).await?;
        *written = (*written).max(version);
        Ok(())
    }

    /// Queue a write of the current state without blocking the caller
    fn persist(&self) {
        let Some(path) = self.path.clone() else {
            return;
        };

        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.snapshot();
        let written = Arc::clone(&self.written);

        tokio::spawn(async move {
            let mut last = written.lock().await;
            if *last >= version {
                return;
            }
            match write_records(&path, &snapshot).await {
                Ok(()) => *last = version,
                Err(e) => warn!(path = %path.display(), error = %format!("{:#}", e), "Could not save source registry"),
            }
        });
    }

    /// Cloned out so no map guard is held across a write
    fn snapshot(&self) -> HashMap<String, SourceRecord> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

async fn read_records(path: &Path) -> Result<HashMap<String, SourceRecord>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(HashMap::new());
    }
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&json).context("Failed to parse source registry")
}

async fn write_records(path: &Path, records: &HashMap<String, SourceRecord>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let json = serde_json::to_string_pretty(records)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))
}
