use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Text,
    Json,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Text => "text",
            DocType::Json => "json",
        }
    }

    /// Chunking method tag recorded on every chunk of an enhanced document
    pub fn chunking_tag(&self) -> &'static str {
        match self {
            DocType::Text => "text-enhanced",
            DocType::Json => "json-aware-enhanced",
        }
    }
}

/// What part of the preprocessing pipeline produced a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Summary,
    Section,
    Body,
    Qa,
    Overview,
    Schema,
    Entity,
    Relationships,
    Index,
}

/// A chunk produced by preprocessing, before it is numbered within its document
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub kind: ChunkKind,
    pub path: Option<String>,
    pub parent: Option<String>,
    pub entity: Option<String>,
}

impl Segment {
    pub fn new(kind: ChunkKind, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
            path: None,
            parent: None,
            entity: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub source: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub indexed_at: DateTime<Utc>,
    pub doc_type: DocType,
    pub chunking: String,
    pub kind: ChunkKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    pub fn chunk_id(source: &str, index: usize) -> String {
        format!("{}_{}", source, index)
    }
}

/// Number a document's segments into chunks.
///
/// Segments whose text is blank after trimming are dropped first, so the
/// resulting `chunk_index` values always cover `0..total_chunks` without gaps.
pub fn number_segments(
    source: &str,
    doc_type: DocType,
    chunking: &str,
    segments: Vec<Segment>,
) -> Vec<Chunk> {
    let indexed_at = Utc::now();
    let kept: Vec<Segment> = segments
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();
    let total_chunks = kept.len();

    kept.into_iter()
        .enumerate()
        .map(|(chunk_index, segment)| Chunk {
            id: Chunk::chunk_id(source, chunk_index),
            text: segment.text,
            metadata: ChunkMetadata {
                source: source.to_string(),
                chunk_index,
                total_chunks,
                indexed_at,
                doc_type,
                chunking: chunking.to_string(),
                kind: segment.kind,
                path: segment.path,
                parent: segment.parent,
                entity: segment.entity,
            },
        })
        .collect()
}
