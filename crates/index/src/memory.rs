//! In-memory [`VectorStore`] for tests and local runs without a Chroma server.
//!
//! Search is brute-force cosine distance over every stored vector.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::{matches_filter, MetadataFilter, QueryMatch, StoredDocument, StoredEntry, VectorRecord, VectorStore};

#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<VectorRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<VectorRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn add(&self, records: Vec<VectorRecord>) -> Result<()> {
        let mut stored = self.records.write().await;
        for record in records {
            stored.retain(|r| r.id != record.id);
            stored.push(record);
        }
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>> {
        let stored = self.records.read().await;
        let mut hits: Vec<QueryMatch> = stored
            .iter()
            .filter(|r| matches_filter(&r.metadata, filter))
            .map(|r| QueryMatch {
                id: r.id.clone(),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
                distance: Some(1.0 - cosine_similarity(vector, &r.vector)),
            })
            .collect();

        hits.sort_by(|a, b| a.distance.unwrap_or(f32::MAX).total_cmp(&b.distance.unwrap_or(f32::MAX)));
        hits.truncate(n_results);
        Ok(hits)
    }

    async fn get(&self, filter: Option<&MetadataFilter>) -> Result<Vec<StoredEntry>> {
        let stored = self.records.read().await;
        Ok(stored
            .iter()
            .filter(|r| matches_filter(&r.metadata, filter))
            .map(|r| StoredEntry {
                id: r.id.clone(),
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<StoredDocument>> {
        let stored = self.records.read().await;
        Ok(stored
            .iter()
            .skip(offset)
            .take(limit)
            .map(|r| StoredDocument {
                id: r.id.clone(),
                text: r.text.clone(),
                metadata: r.metadata.clone(),
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        self.records.write().await.retain(|r| !ids.contains(&r.id));
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::source_filter;
    use serde_json::json;

    fn record(id: &str, source: &str, vector: Vec<f32>) -> VectorRecord {
        VectorRecord {
            id: id.to_string(),
            vector,
            text: format!("text of {}", id),
            metadata: json!({"source": source}).as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_distance() {
        let store = MemoryStore::new();
        store
            .add(vec![
                record("far", "a", vec![0.0, 1.0]),
                record("near", "a", vec![1.0, 0.1]),
                record("mid", "b", vec![1.0, 1.0]),
            ])
            .await
            .unwrap();

        let hits = store.query(&[1.0, 0.0], 2, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["near", "mid"]);

        let filtered = store.query(&[1.0, 0.0], 5, Some(&source_filter("b"))).await.unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "mid");
    }

    #[tokio::test]
    async fn test_add_replaces_same_id_and_delete() {
        let store = MemoryStore::new();
        store.add(vec![record("x", "a", vec![1.0])]).await.unwrap();
        store.add(vec![record("x", "b", vec![1.0])]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(Some(&source_filter("b"))).await.unwrap().len(), 1);

        store.delete(&["x".to_string()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
        assert!(store.heartbeat().await);
    }

    #[tokio::test]
    async fn test_list_pages_in_insertion_order() {
        let store = MemoryStore::new();
        store
            .add(vec![
                record("a_0", "a", vec![1.0]),
                record("a_1", "a", vec![1.0]),
                record("b_0", "b", vec![1.0]),
            ])
            .await
            .unwrap();

        let page = store.list(2, 1).await.unwrap();
        let ids: Vec<&str> = page.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a_1", "b_0"]);
        assert_eq!(page[0].text, "text of a_1");
        assert!(store.list(10, 5).await.unwrap().is_empty());
    }
}
