use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use index::embeddings::DEFAULT_EMBEDDING_MODEL;
use ingest::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use ingest::preprocess::DEFAULT_MAX_JSON_CHUNK_SIZE;
use query::rag::DEFAULT_MAX_CONTEXT_CHARS;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bind_addr: String,
    pub ollama_host: String,
    pub chroma_host: String,
    pub vector_backend: VectorBackend,
    pub model_name: String,
    pub embedding_model: String,
    pub collection_name: String,
    /// Where the source registry is persisted; `None` keeps it in memory only
    pub index_metadata_file: Option<PathBuf>,
    pub chunking: ChunkingConfig,
    pub timeouts: TimeoutConfig,
    pub warmup: RetryConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Chroma,
    Memory,
}

impl FromStr for VectorBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "chroma" | "chromadb" => Ok(VectorBackend::Chroma),
            "memory" => Ok(VectorBackend::Memory),
            other => anyhow::bail!("Unknown vector backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_json_chunk_size: usize,
    pub max_context_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub ollama_secs: u64,
    pub embed_secs: u64,
    pub retrieval_secs: u64,
    pub fragment_secs: u64,
    pub pull_secs: u64,
}

impl TimeoutConfig {
    pub fn ollama(&self) -> Duration {
        Duration::from_secs(self.ollama_secs)
    }

    pub fn embed(&self) -> Duration {
        Duration::from_secs(self.embed_secs)
    }

    pub fn retrieval(&self) -> Duration {
        Duration::from_secs(self.retrieval_secs)
    }

    pub fn fragment(&self) -> Duration {
        Duration::from_secs(self.fragment_secs)
    }

    pub fn pull(&self) -> Duration {
        Duration::from_secs(self.pull_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            chroma_host: "http://localhost:8000".to_string(),
            vector_backend: VectorBackend::Chroma,
            model_name: query::llm::DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            collection_name: "documents".to_string(),
            index_metadata_file: Some(PathBuf::from("data/index_metadata.json")),
            chunking: ChunkingConfig {
                chunk_size: DEFAULT_CHUNK_SIZE,
                chunk_overlap: DEFAULT_CHUNK_OVERLAP,
                max_json_chunk_size: DEFAULT_MAX_JSON_CHUNK_SIZE,
                max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            },
            timeouts: TimeoutConfig {
                ollama_secs: 300,
                embed_secs: 30,
                retrieval_secs: 30,
                fragment_secs: 60,
                pull_secs: 600,
            },
            warmup: RetryConfig {
                max_retries: 30,
                initial_backoff_ms: 2000,
                max_backoff_ms: 10000,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        set_string(&lookup, "BIND_ADDR", &mut config.bind_addr);
        set_string(&lookup, "OLLAMA_HOST", &mut config.ollama_host);
        set_string(&lookup, "CHROMA_HOST", &mut config.chroma_host);
        set_string(&lookup, "MODEL_NAME", &mut config.model_name);
        set_string(&lookup, "EMBEDDING_MODEL", &mut config.embedding_model);
        set_string(&lookup, "COLLECTION_NAME", &mut config.collection_name);
        set_parsed(&lookup, "VECTOR_BACKEND", &mut config.vector_backend)?;

        if let Some(path) = lookup("INDEX_METADATA_FILE") {
            config.index_metadata_file = (!path.trim().is_empty()).then(|| PathBuf::from(path));
        }

        set_parsed(&lookup, "CHUNK_SIZE", &mut config.chunking.chunk_size)?;
        set_parsed(&lookup, "CHUNK_OVERLAP", &mut config.chunking.chunk_overlap)?;
        set_parsed(&lookup, "MAX_JSON_CHUNK_SIZE", &mut config.chunking.max_json_chunk_size)?;
        set_parsed(&lookup, "MAX_CONTEXT_CHARS", &mut config.chunking.max_context_chars)?;

        set_parsed(&lookup, "OLLAMA_TIMEOUT_SECS", &mut config.timeouts.ollama_secs)?;
        set_parsed(&lookup, "EMBED_TIMEOUT_SECS", &mut config.timeouts.embed_secs)?;
        set_parsed(&lookup, "RETRIEVAL_TIMEOUT_SECS", &mut config.timeouts.retrieval_secs)?;
        set_parsed(&lookup, "FRAGMENT_TIMEOUT_SECS", &mut config.timeouts.fragment_secs)?;
        set_parsed(&lookup, "OLLAMA_PULL_TIMEOUT_SECS", &mut config.timeouts.pull_secs)?;

        set_parsed(&lookup, "WARMUP_MAX_RETRIES", &mut config.warmup.max_retries)?;
        set_parsed(&lookup, "WARMUP_RETRY_DELAY_MS", &mut config.warmup.initial_backoff_ms)?;
        set_parsed(&lookup, "WARMUP_MAX_DELAY_MS", &mut config.warmup.max_backoff_ms)?;

        Ok(config)
    }

    pub fn preprocess_config(&self) -> ingest::PreprocessConfig {
        ingest::PreprocessConfig {
            chunker: self.chunker_config(),
            max_json_chunk_size: self.chunking.max_json_chunk_size,
        }
    }

    pub fn chunker_config(&self) -> ingest::ChunkerConfig {
        ingest::ChunkerConfig::new(self.chunking.chunk_size, self.chunking.chunk_overlap)
    }

    pub fn rag_config(&self) -> query::RagConfig {
        query::RagConfig {
            max_context_chars: self.chunking.max_context_chars,
            embed_timeout: self.timeouts.embed(),
            retrieval_timeout: self.timeouts.retrieval(),
            generation_timeout: self.timeouts.ollama(),
            fragment_timeout: self.timeouts.fragment(),
        }
    }
}

fn set_string(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut String) {
    if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
        *target = value;
    }
}

fn set_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw))?;
    }
    Ok(())
}
