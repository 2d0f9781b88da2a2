use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

/// Flat chunk metadata as stored next to each vector
pub type Metadata = Map<String, Value>;

/// Exact-match filter: every key must equal the given value
pub type MetadataFilter = Map<String, Value>;

#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub vector: Vec<f32>,
    pub text: String,
    pub metadata: Metadata,
}

/// One ranked hit from a nearest-neighbour query
#[derive(Debug, Clone, Serialize)]
pub struct QueryMatch {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub distance: Option<f32>,
}

impl QueryMatch {
    /// The `source` metadata field, or `Unknown` when absent
    pub fn source(&self) -> &str {
        self.metadata
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredEntry {
    pub id: String,
    pub metadata: Metadata,
}

/// A stored chunk with its text, as returned by [`VectorStore::list`]
#[derive(Debug, Clone, Serialize)]
pub struct StoredDocument {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// Vector store collaborator.
///
/// Implementations are shared across requests behind an `Arc`, so every
/// method takes `&self`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Prepare the backing collection. Calling it more than once is harmless.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Insert records, replacing any stored under the same id
    async fn add(&self, records: Vec<VectorRecord>) -> Result<()>;

    /// Nearest records first
    async fn query(
        &self,
        vector: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>>;

    async fn get(&self, filter: Option<&MetadataFilter>) -> Result<Vec<StoredEntry>>;

    /// One page of stored chunks in insertion order
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<StoredDocument>>;

    async fn delete(&self, ids: &[String]) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Cheap reachability check used by the health endpoint
    async fn heartbeat(&self) -> bool {
        self.count().await.is_ok()
    }
}

pub fn matches_filter(metadata: &Metadata, filter: Option<&MetadataFilter>) -> bool {
    filter.is_none_or(|f| f.iter().all(|(key, expected)| metadata.get(key) == Some(expected)))
}

pub fn source_filter(source: &str) -> MetadataFilter {
    let mut filter = MetadataFilter::new();
    filter.insert("source".to_string(), Value::String(source.to_string()));
    filter
}
