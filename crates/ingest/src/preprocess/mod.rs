//! Type-aware document preprocessing.
//!
//! A document is routed to the structured (JSON) pipeline when its filename or
//! leading character suggests JSON and it actually parses; everything else,
//! including JSON that fails to parse, goes through the text pipeline.

pub mod json;
pub mod text;

use serde::Serialize;
use tracing::debug;

use crate::chunk::{number_segments, Chunk, DocType};
use crate::chunker::ChunkerConfig;

pub const DEFAULT_MAX_JSON_CHUNK_SIZE: usize = 800;

#[derive(Debug, Clone, Copy)]
pub struct PreprocessConfig {
    pub chunker: ChunkerConfig,
    /// Entity chunks longer than this are dropped
    pub max_json_chunk_size: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            max_json_chunk_size: DEFAULT_MAX_JSON_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentMetadata {
    pub filename: String,
    pub doc_type: DocType,
    pub chunking: String,
    pub preprocessing: String,
    /// Length of the raw content in bytes
    pub size_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct PreprocessedDocument {
    pub chunks: Vec<Chunk>,
    pub metadata: DocumentMetadata,
}

pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(PreprocessConfig::default())
    }
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self { config }
    }

    pub fn preprocess(&self, content: &str, filename: &str) -> PreprocessedDocument {
        let (doc_type, segments) = match self.parse_structured(content, filename) {
            Some(value) => (
                DocType::Json,
                json::preprocess_json(&value, filename, self.config.max_json_chunk_size),
            ),
            None => (
                DocType::Text,
                text::preprocess_text(content, filename, self.config.chunker),
            ),
        };

        let chunking = doc_type.chunking_tag();
        let chunks = number_segments(filename, doc_type, chunking, segments);

        debug!(
            filename,
            doc_type = doc_type.as_str(),
            chunks = chunks.len(),
            "Preprocessed document"
        );

        PreprocessedDocument {
            chunks,
            metadata: DocumentMetadata {
                filename: filename.to_string(),
                doc_type,
                chunking: chunking.to_string(),
                preprocessing: "enhanced".to_string(),
                size_bytes: content.len(),
            },
        }
    }

    fn parse_structured(&self, content: &str, filename: &str) -> Option<serde_json::Value> {
        let trimmed = content.trim_start();
        let looks_structured = filename.ends_with(".json")
            || trimmed.starts_with('{')
            || trimmed.starts_with('[');

        if !looks_structured {
            return None;
        }

        match serde_json::from_str(content) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(filename, error = %e, "JSON parse failed, falling back to text");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkKind;

    #[test]
    fn test_detects_json_by_content() {
        let doc = Preprocessor::default().preprocess(r#"{"name": "svc", "port": 80}"#, "config");

        assert_eq!(doc.metadata.doc_type, DocType::Json);
        assert_eq!(doc.metadata.chunking, "json-aware-enhanced");
        assert_eq!(doc.chunks[0].metadata.kind, ChunkKind::Overview);
    }

    #[test]
    fn test_malformed_json_falls_back_to_text() {
        let doc = Preprocessor::default().preprocess("{ this is not json", "broken.json");

        assert_eq!(doc.metadata.doc_type, DocType::Text);
        assert_eq!(doc.metadata.chunking, "text-enhanced");
        assert_eq!(doc.chunks[0].metadata.kind, ChunkKind::Summary);
        assert!(doc.chunks.iter().all(|c| c.metadata.doc_type == DocType::Text));
    }

    #[test]
    fn test_chunk_indices_are_contiguous() {
        let content = "# Intro\nRust is a systems programming language focused on safety.\n\n# Usage\nRun cargo build.";
        let doc = Preprocessor::default().preprocess(content, "guide.md");

        let total = doc.chunks.len();
        assert!(total >= 3);
        for (i, chunk) in doc.chunks.iter().enumerate() {
            assert_eq!(chunk.metadata.chunk_index, i);
            assert_eq!(chunk.metadata.total_chunks, total);
            assert_eq!(chunk.metadata.source, "guide.md");
            assert!(!chunk.text.trim().is_empty());
        }
    }
}
