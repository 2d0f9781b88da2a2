pub mod chroma;
pub mod embeddings;
pub mod memory;
pub mod store;

pub use chroma::ChromaStore;
pub use embeddings::{Embedder, EmbeddingClient};
pub use memory::MemoryStore;
pub use store::{Metadata, MetadataFilter, QueryMatch, StoredDocument, StoredEntry, VectorRecord, VectorStore};

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes chunks into the vector store and reads them back.
///
/// Chunk ids are derived from `(source, chunk_index)`, so re-indexing a source
/// overwrites matching ids and then removes the ones the new version no longer
/// has. Otherwise a shorter second version would leave stale tail chunks behind.
#[derive(Clone)]
pub struct Indexer {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
}

impl Indexer {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn VectorStore>) -> Self {
        Self { embedder, store }
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        Arc::clone(&self.embedder)
    }

    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::clone(&self.store)
    }

    pub async fn init(&self) -> Result<()> {
        self.store.init().await?;
        info!(model = %self.embedder.model(), "Indexer initialized");
        Ok(())
    }

    /// Embed and store a batch of chunks, returning how many were written.
    ///
    /// Old chunks of the same sources are only removed once the new set is
    /// stored, so a failed embed or write leaves the previous version intact.
    pub async fn index_chunks(&self, chunks: &[ingest::Chunk]) -> Result<usize> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self
            .embedder
            .encode(&texts)
            .await
            .context("Failed to embed chunks")?;

        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "Embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }

        let mut records = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors) {
            records.push(VectorRecord {
                id: chunk.id.clone(),
                vector,
                text: chunk.text.clone(),
                metadata: to_metadata(&chunk.metadata)?,
            });
        }

        let new_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let sources: BTreeSet<&str> = chunks.iter().map(|c| c.metadata.source.as_str()).collect();
        let mut stale = Vec::new();
        for source in sources {
            let filter = store::source_filter(source);
            stale.extend(
                self.store
                    .get(Some(&filter))
                    .await?
                    .into_iter()
                    .map(|entry| entry.id)
                    .filter(|id| !new_ids.contains(id.as_str())),
            );
        }

        let written = records.len();
        self.store.add(records).await.context("Failed to store chunks")?;

        if !stale.is_empty() {
            self.store
                .delete(&stale)
                .await
                .context("Failed to remove superseded chunks")?;
            debug!(removed = stale.len(), "Removed superseded chunks");
        }
        info!(chunks = written, "Indexed chunks");

        Ok(written)
    }

    /// Remove every chunk of a source, returning how many were removed
    pub async fn delete_source(&self, source: &str) -> Result<usize> {
        let filter = store::source_filter(source);
        let ids: Vec<String> = self
            .store
            .get(Some(&filter))
            .await?
            .into_iter()
            .map(|entry| entry.id)
            .collect();

        self.store.delete(&ids).await?;
        Ok(ids.len())
    }

    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }

    /// Plain semantic search, no generation
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self
            .embedder
            .encode(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .context("Embedder returned no vector for query")?;

        self.store.query(&vector, top_k, filter).await
    }
}

fn to_metadata(metadata: &ingest::ChunkMetadata) -> Result<Metadata> {
    match serde_json::to_value(metadata)? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("Chunk metadata serialized to non-object: {}", other),
    }
}
