use anyhow::Result as AnyResult;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use index::{Embedder, VectorStore};

use crate::classifier::{self, ComplexityDecision};
use crate::error::QueryError;
use crate::llm::{DEFAULT_TEMPERATURE, GenerateOptions, Generator};
use crate::stream::RagStream;
use crate::timing::{self, Timings};

pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 3000;
pub const TRUNCATION_MARKER: &str = "\n[...truncated for performance...]";

#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Context budget in characters
    pub max_context_chars: usize,
    pub embed_timeout: Duration,
    pub retrieval_timeout: Duration,
    pub generation_timeout: Duration,
    /// Longest wait for the next streamed fragment
    pub fragment_timeout: Duration,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
            embed_timeout: Duration::from_secs(30),
            retrieval_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(300),
            fragment_timeout: Duration::from_secs(60),
        }
    }
}

/// Fields left out or sent as `null` fall back to their defaults; a missing
/// query is reported by validation rather than by deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub query: Option<String>,
    pub top_k: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub activity_id: Option<String>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RagAnswer {
    pub query: String,
    pub response: String,
    pub sources: Vec<String>,
    pub context_chunks_used: usize,
    pub timings: Timings,
}

/// A validated request with its retrieval depth and answer length resolved
#[derive(Debug, Clone)]
pub(crate) struct Plan {
    pub query: String,
    pub auto: ComplexityDecision,
    pub used: ComplexityDecision,
    pub temperature: f32,
}

impl Plan {
    pub fn resolve(request: &QueryRequest) -> Result<Self, QueryError> {
        let query = request.query.as_deref().unwrap_or_default().trim();
        if query.is_empty() {
            return Err(QueryError::Validation("query is required".to_string()));
        }

        let auto = classifier::classify(query);
        let used = ComplexityDecision {
            top_k: request.top_k.unwrap_or(auto.top_k),
            max_tokens: request.max_tokens.unwrap_or(auto.max_tokens),
        };

        Ok(Self {
            query: query.to_string(),
            auto,
            used,
            temperature: request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        })
    }

    pub fn options(&self) -> GenerateOptions {
        GenerateOptions {
            max_tokens: self.used.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Assembled context for one request
#[derive(Debug, Clone, Default)]
pub(crate) struct Retrieval {
    pub context: String,
    pub sources: Vec<String>,
    pub chunks_used: usize,
    pub embedding: Duration,
    pub retrieval: Duration,
}

impl Retrieval {
    /// Timings filled in as far as retrieval goes
    pub fn timings(&self, plan: &Plan) -> Timings {
        Timings {
            embedding_ms: timing::millis(self.embedding),
            retrieval_ms: timing::millis(self.retrieval),
            context_chars: self.context.chars().count(),
            auto_top_k: plan.auto.top_k,
            auto_max_tokens: plan.auto.max_tokens,
            used_top_k: plan.used.top_k,
            used_max_tokens: plan.used.max_tokens,
            skipped_context: plan.used.top_k == 0,
            ..Timings::default()
        }
    }
}

/// Retrieval-augmented answering over the injected collaborators
#[derive(Clone)]
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    generator: Arc<dyn Generator>,
    config: RagConfig,
}

impl RagEngine {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
        config: RagConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            generator,
            config,
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub(crate) fn generator(&self) -> &Arc<dyn Generator> {
        &self.generator
    }

    /// Answer in one piece.
    ///
    /// Retrieval failures are returned as errors. A generation failure is not:
    /// the answer text then carries the error so the caller still gets the
    /// retrieved sources and timings.
    pub async fn answer(&self, request: QueryRequest) -> Result<RagAnswer, QueryError> {
        let started = Instant::now();
        let plan = Plan::resolve(&request)?;
        let retrieval = self.retrieve(&plan).await?;
        let mut timings = retrieval.timings(&plan);

        let prompt = build_prompt(&retrieval.context, &plan.query);
        let generation_started = Instant::now();
        let generated = bounded(
            "generator",
            self.config.generation_timeout,
            self.generator.generate(&prompt, plan.options()),
        )
        .await;
        let generation_elapsed = generation_started.elapsed();

        let response = match generated {
            Ok(generation) => {
                timings.tokens_generated = generation.tokens_generated;
                timings.tokens_per_sec =
                    timing::tokens_per_sec(generation.tokens_generated, generation_elapsed);
                generation.text
            }
            Err(e) => {
                warn!(error = %e, "Generation failed, returning degraded answer");
                format!("AI service error: {}", e)
            }
        };

        timings.generation_ms = timing::millis(generation_elapsed);
        timings.total_ms = timing::millis(started.elapsed());

        info!(
            activity_id = request.activity_id.as_deref().unwrap_or("-"),
            top_k = plan.used.top_k,
            chunks = retrieval.chunks_used,
            total_ms = timings.total_ms,
            "Answered query"
        );

        Ok(RagAnswer {
            query: plan.query,
            response,
            sources: retrieval.sources,
            context_chunks_used: retrieval.chunks_used,
            timings,
        })
    }

    /// Answer as an event stream: `start`, any number of `token`, then `done`
    /// or `error`. A request that fails before retrieval completes yields a
    /// lone `error`.
    pub fn answer_stream(&self, request: QueryRequest) -> RagStream {
        RagStream::new(self.clone(), request)
    }

    pub(crate) async fn retrieve(&self, plan: &Plan) -> Result<Retrieval, QueryError> {
        if plan.used.top_k == 0 {
            debug!(query = %plan.query, "Skipping retrieval");
            return Ok(Retrieval::default());
        }

        let embed_started = Instant::now();
        let vectors = bounded(
            "embedder",
            self.config.embed_timeout,
            self.embedder.encode(std::slice::from_ref(&plan.query)),
        )
        .await?;
        let embedding = embed_started.elapsed();

        let vector = vectors.into_iter().next().ok_or_else(|| QueryError::Upstream {
            service: "embedder",
            message: "no vector returned for query".to_string(),
        })?;

        let retrieval_started = Instant::now();
        let matches = bounded(
            "vector_store",
            self.config.retrieval_timeout,
            self.store.query(&vector, plan.used.top_k, None),
        )
        .await?;
        let retrieval = retrieval_started.elapsed();

        let mut sources: Vec<String> = Vec::new();
        for hit in &matches {
            let source = hit.source();
            if !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }

        let joined = matches
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(Retrieval {
            context: truncate_context(joined, self.config.max_context_chars),
            sources,
            chunks_used: matches.len(),
            embedding,
            retrieval,
        })
    }
}

/// Run a collaborator call under a deadline, classifying whatever goes wrong
pub(crate) async fn bounded<T>(
    service: &'static str,
    limit: Duration,
    call: impl Future<Output = AnyResult<T>>,
) -> Result<T, QueryError> {
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(QueryError::classify(service, e)),
        Err(_) => Err(QueryError::UpstreamTimeout { service }),
    }
}

/// Cut context down to `budget` characters, marking the cut
pub fn truncate_context(context: String, budget: usize) -> String {
    match context.char_indices().nth(budget) {
        Some((cut, _)) => {
            let mut truncated = context[..cut].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => context,
    }
}

pub fn build_prompt(context: &str, query: &str) -> String {
    if context.is_empty() {
        return query.to_string();
    }
    format!(
        "Based on the following information:\n\n{}\n\nPlease answer: {}",
        context, query
    )
}
