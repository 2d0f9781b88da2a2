use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::info;

use crate::store::{Metadata, MetadataFilter, QueryMatch, StoredDocument, StoredEntry, VectorRecord, VectorStore};

const TENANT: &str = "default_tenant";
const DATABASE: &str = "default_database";

/// Chroma vector store over its v2 REST API.
///
/// The collection id is resolved on first use and cached for the lifetime of
/// the store, so concurrent first callers share a single get-or-create call.
pub struct ChromaStore {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
    collection_id: OnceCell<String>,
}

#[derive(Serialize)]
struct CreateCollection<'a> {
    name: &'a str,
    get_or_create: bool,
    metadata: Value,
}

#[derive(Deserialize)]
struct CollectionResponse {
    id: String,
}

#[derive(Serialize)]
struct AddRequest {
    ids: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    documents: Vec<String>,
    metadatas: Vec<Metadata>,
}

#[derive(Deserialize)]
struct QueryResponse {
    ids: Vec<Vec<String>>,
    #[serde(default)]
    documents: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    metadatas: Option<Vec<Vec<Option<Metadata>>>>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f32>>>>,
}

#[derive(Deserialize)]
struct GetResponse {
    ids: Vec<String>,
    #[serde(default)]
    documents: Option<Vec<Option<String>>>,
    #[serde(default)]
    metadatas: Option<Vec<Option<Metadata>>>,
}

impl ChromaStore {
    pub fn new(base_url: String, collection_name: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Chroma HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            collection_name,
            collection_id: OnceCell::new(),
        })
    }

    fn collections_url(&self) -> String {
        format!(
            "{}/api/v2/tenants/{}/databases/{}/collections",
            self.base_url, TENANT, DATABASE
        )
    }

    async fn collection_url(&self) -> Result<String> {
        let id = self
            .collection_id
            .get_or_try_init(|| self.get_or_create_collection())
            .await?;
        Ok(format!("{}/{}", self.collections_url(), id))
    }

    async fn get_or_create_collection(&self) -> Result<String> {
        let response = self
            .client
            .post(self.collections_url())
            .json(&CreateCollection {
                name: &self.collection_name,
                get_or_create: true,
                metadata: json!({"description": "Document chunk embeddings"}),
            })
            .send()
            .await
            .context("Failed to reach Chroma")?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to get or create collection: {}", error_text);
        }

        let collection: CollectionResponse = response
            .json()
            .await
            .context("Failed to parse Chroma collection response")?;

        info!(
            collection = %self.collection_name,
            id = %collection.id,
            "Chroma collection ready"
        );
        Ok(collection.id)
    }

    async fn post(&self, action: &str, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.collection_url().await?, action);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send Chroma {} request", action))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Chroma {} failed ({}): {}", action, status, error_text);
        }

        Ok(response)
    }
}

/// Chroma's `where` clause wants a single key per object; several keys are
/// combined with `$and`.
pub fn to_where_clause(filter: &MetadataFilter) -> Value {
    if filter.len() <= 1 {
        return Value::Object(filter.clone());
    }

    let clauses: Vec<Value> = filter
        .iter()
        .map(|(key, value)| json!({ key: value }))
        .collect();
    json!({ "$and": clauses })
}

#[async_trait]
impl VectorStore for ChromaStore {
    async fn init(&self) -> Result<()> {
        self.collection_url().await.map(|_| ())
    }

    async fn add(&self, records: Vec<VectorRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut request = AddRequest {
            ids: Vec::with_capacity(records.len()),
            embeddings: Vec::with_capacity(records.len()),
            documents: Vec::with_capacity(records.len()),
            metadatas: Vec::with_capacity(records.len()),
        };
        for record in records {
            request.ids.push(record.id);
            request.embeddings.push(record.vector);
            request.documents.push(record.text);
            request.metadatas.push(record.metadata);
        }

        let body = serde_json::to_value(&request)?;
        self.post("upsert", &body).await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        n_results: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryMatch>> {
        let mut body = json!({
            "query_embeddings": [vector],
            "n_results": n_results,
            "include": ["documents", "metadatas", "distances"],
        });
        if let Some(filter) = filter {
            body["where"] = to_where_clause(filter);
        }

        let response: QueryResponse = self
            .post("query", &body)
            .await?
            .json()
            .await
            .context("Failed to parse Chroma query response")?;

        // One query embedding was sent, so only the first result row matters
        let ids = response.ids.into_iter().next().unwrap_or_default();
        let documents = response.documents.and_then(|d| d.into_iter().next()).unwrap_or_default();
        let metadatas = response.metadatas.and_then(|m| m.into_iter().next()).unwrap_or_default();
        let distances = response.distances.and_then(|d| d.into_iter().next()).unwrap_or_default();

        Ok(ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| QueryMatch {
                id,
                text: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_default(),
                distance: distances.get(i).copied().flatten(),
            })
            .collect())
    }

    async fn get(&self, filter: Option<&MetadataFilter>) -> Result<Vec<StoredEntry>> {
        let mut body = json!({ "include": ["metadatas"] });
        if let Some(filter) = filter {
            body["where"] = to_where_clause(filter);
        }

        let response: GetResponse = self
            .post("get", &body)
            .await?
            .json()
            .await
            .context("Failed to parse Chroma get response")?;

        let metadatas = response.metadatas.unwrap_or_default();
        Ok(response
            .ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| StoredEntry {
                id,
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_default(),
            })
            .collect())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<StoredDocument>> {
        let body = json!({
            "limit": limit,
            "offset": offset,
            "include": ["documents", "metadatas"],
        });

        let response: GetResponse = self
            .post("get", &body)
            .await?
            .json()
            .await
            .context("Failed to parse Chroma get response")?;

        let documents = response.documents.unwrap_or_default();
        let metadatas = response.metadatas.unwrap_or_default();
        Ok(response
            .ids
            .into_iter()
            .enumerate()
            .map(|(i, id)| StoredDocument {
                id,
                text: documents.get(i).cloned().flatten().unwrap_or_default(),
                metadata: metadatas.get(i).cloned().flatten().unwrap_or_default(),
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post("delete", &json!({ "ids": ids })).await?;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let url = format!("{}/count", self.collection_url().await?);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to send Chroma count request")?;

        if !response.status().is_success() {
            anyhow::bail!("Chroma count failed: {}", response.status());
        }

        response.json().await.context("Failed to parse Chroma count")
    }

    async fn heartbeat(&self) -> bool {
        let url = format!("{}/api/v2/heartbeat", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}
