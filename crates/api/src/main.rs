mod config;
mod error;
mod metrics;
mod retry;
mod sources;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use index::embeddings::DEFAULT_EMBEDDING_DIMENSION;
use index::{
    ChromaStore, Embedder, EmbeddingClient, Indexer, MemoryStore, MetadataFilter, QueryMatch, StoredDocument, VectorStore,
};
use ingest::{ChunkerConfig, FileReader, Preprocessor};
use query::{GenerateOptions, Generator, OllamaGenerator, QueryError, QueryRequest, RagAnswer, RagEngine, StreamEvent};

use crate::config::{AppConfig, VectorBackend};
use crate::error::ApiError;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::retry::RetryPolicy;
use crate::sources::{SourceRecord, SourceRegistry};

const ACTIVITY_HEADER: &str = "x-activity-id";
const DEFAULT_SEARCH_TOP_K: usize = 5;
const DEFAULT_LIST_LIMIT: usize = 50;
const DEFAULT_GENERATE_MAX_TOKENS: u32 = 512;

struct AppState {
    config: AppConfig,
    indexer: Indexer,
    engine: RagEngine,
    generator: Arc<dyn Generator>,
    preprocessor: Preprocessor,
    sources: SourceRegistry,
    metrics: Metrics,
}

impl AppState {
    fn new(
        config: AppConfig,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        generator: Arc<dyn Generator>,
        sources: SourceRegistry,
    ) -> Arc<Self> {
        let indexer = Indexer::new(Arc::clone(&embedder), Arc::clone(&store));
        let engine = RagEngine::new(embedder, store, Arc::clone(&generator), config.rag_config());
        let preprocessor = Preprocessor::new(config.preprocess_config());

        Arc::new(Self {
            config,
            indexer,
            engine,
            generator,
            preprocessor,
            sources,
            metrics: Metrics::new(),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    info!(
        ollama = %config.ollama_host,
        backend = ?config.vector_backend,
        model = %config.model_name,
        "Starting document RAG service"
    );

    let embedder: Arc<dyn Embedder> = Arc::new(EmbeddingClient::new(
        config.ollama_host.clone(),
        config.embedding_model.clone(),
        config.timeouts.embed(),
    )?);

    let store: Arc<dyn VectorStore> = match config.vector_backend {
        VectorBackend::Chroma => Arc::new(ChromaStore::new(
            config.chroma_host.clone(),
            config.collection_name.clone(),
            config.timeouts.retrieval(),
        )?),
        VectorBackend::Memory => Arc::new(MemoryStore::new()),
    };

    let ollama = Arc::new(
        OllamaGenerator::new(
            config.ollama_host.clone(),
            config.model_name.clone(),
            config.timeouts.ollama(),
        )?
        .with_pull_timeout(config.timeouts.pull()),
    );

    let sources = SourceRegistry::load(config.index_metadata_file.clone()).await;
    let bind_addr = config.bind_addr.clone();
    let warmup = RetryPolicy::from_config(&config.warmup);

    let state = AppState::new(config, embedder, store, ollama.clone(), sources);

    // The collection is created lazily on first use if the store is not up yet
    if let Err(e) = state.indexer.init().await {
        warn!(error = %format!("{:#}", e), "Vector store not ready at startup");
    }

    tokio::spawn(async move {
        if let Err(e) = warmup.retry("model_warmup", || ollama.warmup()).await {
            warn!(error = %format!("{:#}", e), "Model warm-up failed, first request will be slow");
        }
    });

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(ACTIVITY_HEADER)]);

    Router::new()
        .route("/health", get(health_check))
        .route("/index", post(index_text))
        .route("/index/batch", post(index_batch))
        .route("/ingest", post(ingest_path))
        .route("/list", get(list_documents))
        .route("/search", post(search))
        .route("/search/rag", post(search_rag))
        .route("/search/rag/stream", post(search_rag_stream))
        .route("/sources", get(list_sources))
        .route("/sources/*source_id", delete(delete_source))
        .route("/stats", get(get_stats))
        .route("/generate", post(generate_text))
        .route("/models", get(list_models))
        .route("/models/pull", post(pull_model))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn track_requests(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let status = response.status();
    state
        .metrics
        .record_request(!status.is_client_error() && !status.is_server_error());
    response
}

/// Client-supplied activity id, or a fresh one
fn activity_id(headers: &HeaderMap) -> String {
    headers
        .get(ACTIVITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn set_activity_header(headers: &mut HeaderMap, activity_id: &str) {
    if let Ok(value) = HeaderValue::from_str(activity_id) {
        headers.insert(HeaderName::from_static(ACTIVITY_HEADER), value);
    }
}

// ============== Health & Stats ==============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    ollama: ServiceStatus,
    vector_store: ServiceStatus,
    embeddings: EmbeddingInfo,
    documents_count: usize,
}

#[derive(Serialize)]
struct ServiceStatus {
    running: bool,
    detail: String,
}

#[derive(Serialize)]
struct EmbeddingInfo {
    model: String,
}

async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.indexer.store();
    let (ollama_running, store_running) =
        tokio::join!(state.generator.is_available(), store.heartbeat());
    let documents_count = state.indexer.count().await.unwrap_or(0);

    Json(HealthResponse {
        status: if ollama_running && store_running { "healthy" } else { "degraded" },
        ollama: ServiceStatus {
            running: ollama_running,
            detail: state.generator.model().to_string(),
        },
        vector_store: ServiceStatus {
            running: store_running,
            detail: format!("{:?}", state.config.vector_backend).to_lowercase(),
        },
        embeddings: EmbeddingInfo {
            model: state.config.embedding_model.clone(),
        },
        documents_count,
    })
}

#[derive(Serialize)]
struct StatsResponse {
    total_chunks: usize,
    total_sources: usize,
    embedding_model: String,
    embedding_dimension: usize,
    generation_model: String,
    metrics: MetricsSnapshot,
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        total_chunks: state.indexer.count().await?,
        total_sources: state.sources.count(),
        embedding_model: state.config.embedding_model.clone(),
        embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
        generation_model: state.generator.model().to_string(),
        metrics: state.metrics.snapshot(),
    }))
}

// ============== Indexing ==============

#[derive(Deserialize)]
struct IndexRequest {
    text: Option<String>,
    source: Option<String>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Serialize)]
struct IndexResponse {
    status: &'static str,
    document_id: String,
    chunks_indexed: usize,
    total_documents: usize,
}

async fn index_text(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, ApiError> {
    let started = Instant::now();
    let text = req
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing text in request".to_string()))?;
    let source = req
        .source
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let chunker = request_chunker(&state.config, req.chunk_size, req.chunk_overlap);
    let chunks = ingest::chunk_plain(&text, &source, chunker);
    let indexed = state.indexer.index_chunks(&chunks).await?;

    let mut metadata = Map::new();
    metadata.insert("chunking".to_string(), Value::from(ingest::PLAIN_CHUNKING));
    state
        .sources
        .add(SourceRecord::new(&source, indexed, text.len()).with_metadata(metadata));
    state.metrics.record_ingest(started.elapsed(), indexed);

    Ok(Json(IndexResponse {
        status: "success",
        document_id: source,
        chunks_indexed: indexed,
        total_documents: state.indexer.count().await?,
    }))
}

/// Per-request chunk sizes, falling back to the configured ones
fn request_chunker(config: &AppConfig, chunk_size: Option<usize>, overlap: Option<usize>) -> ChunkerConfig {
    let defaults = config.chunker_config();
    ChunkerConfig::new(
        chunk_size.unwrap_or(defaults.chunk_size),
        overlap.unwrap_or(defaults.overlap),
    )
}

#[derive(Deserialize)]
struct BatchDocument {
    #[serde(default)]
    text: String,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct BatchIndexRequest {
    documents: Option<Vec<BatchDocument>>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
}

#[derive(Serialize)]
struct BatchIndexResponse {
    status: &'static str,
    documents_indexed: usize,
    total_chunks: usize,
    document_ids: Vec<String>,
}

async fn index_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchIndexRequest>,
) -> Result<Json<BatchIndexResponse>, ApiError> {
    let started = Instant::now();
    let documents = req
        .documents
        .ok_or_else(|| ApiError::BadRequest("Missing documents in request".to_string()))?;
    let chunker = request_chunker(&state.config, req.chunk_size, req.chunk_overlap);

    let mut document_ids = Vec::with_capacity(documents.len());
    let mut total_chunks = 0;

    for document in documents {
        if document.text.trim().is_empty() {
            continue;
        }
        let mut metadata = document.metadata;
        let source = match metadata.remove("source") {
            Some(Value::String(source)) if !source.trim().is_empty() => source,
            _ => Uuid::new_v4().to_string(),
        };

        let chunks = ingest::chunk_plain(&document.text, &source, chunker);
        let indexed = state.indexer.index_chunks(&chunks).await?;
        total_chunks += indexed;

        metadata.insert("chunking".to_string(), Value::from(ingest::PLAIN_CHUNKING));
        state
            .sources
            .add(SourceRecord::new(&source, indexed, document.text.len()).with_metadata(metadata));
        document_ids.push(source);
    }

    state.metrics.record_ingest(started.elapsed(), total_chunks);
    info!(documents = document_ids.len(), chunks = total_chunks, "Indexed batch");

    Ok(Json(BatchIndexResponse {
        status: "success",
        documents_indexed: document_ids.len(),
        total_chunks,
        document_ids,
    }))
}

#[derive(Deserialize)]
struct IngestRequest {
    path: String,
}

#[derive(Serialize)]
struct IngestedDocument {
    filename: String,
    chunks_indexed: usize,
    size_bytes: usize,
    chunking_method: String,
}

#[derive(Serialize)]
struct IngestResponse {
    status: &'static str,
    documents: Vec<IngestedDocument>,
    chunks_indexed: usize,
    preprocess_time_sec: f64,
    total_documents: usize,
}

async fn ingest_path(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let started = Instant::now();
    let path = PathBuf::from(&req.path);

    let Ok(file_meta) = tokio::fs::metadata(&path).await else {
        return Err(ApiError::NotFound(format!("Path not found: {}", req.path)));
    };

    let documents = if file_meta.is_dir() {
        ingest::ingest_directory(&path, &state.preprocessor).await?
    } else if FileReader::is_supported(&path) {
        vec![ingest::ingest_file(&path, &state.preprocessor).await?]
    } else {
        return Err(ApiError::BadRequest(format!(
            "Unsupported file format: {}",
            req.path
        )));
    };
    let preprocess_time = started.elapsed();

    let mut ingested = Vec::with_capacity(documents.len());
    let mut total_chunks = 0;

    for document in documents {
        let indexed = state.indexer.index_chunks(&document.chunks).await?;
        total_chunks += indexed;

        let meta = &document.metadata;
        let mut metadata = Map::new();
        metadata.insert("doc_type".to_string(), Value::from(meta.doc_type.as_str()));
        metadata.insert("chunking".to_string(), Value::from(meta.chunking.clone()));
        metadata.insert("preprocessing".to_string(), Value::from(meta.preprocessing.clone()));
        state
            .sources
            .add(SourceRecord::new(&meta.filename, indexed, meta.size_bytes).with_metadata(metadata));

        ingested.push(IngestedDocument {
            filename: meta.filename.clone(),
            chunks_indexed: indexed,
            size_bytes: meta.size_bytes,
            chunking_method: meta.chunking.clone(),
        });
    }

    state.metrics.record_ingest(started.elapsed(), total_chunks);
    info!(
        path = %req.path,
        documents = ingested.len(),
        chunks = total_chunks,
        "Ingested path"
    );

    Ok(Json(IngestResponse {
        status: "success",
        documents: ingested,
        chunks_indexed: total_chunks,
        preprocess_time_sec: (preprocess_time.as_secs_f64() * 100.0).round() / 100.0,
        total_documents: state.indexer.count().await?,
    }))
}

// ============== Sources ==============

#[derive(Serialize)]
struct SourcesResponse {
    sources: Vec<SourceRecord>,
    total_sources: usize,
    total_chunks: usize,
}

async fn list_sources(State(state): State<Arc<AppState>>) -> Result<Json<SourcesResponse>, ApiError> {
    let sources = state.sources.list();
    Ok(Json(SourcesResponse {
        total_sources: sources.len(),
        sources,
        total_chunks: state.indexer.count().await?,
    }))
}

#[derive(Serialize)]
struct DeleteResponse {
    status: &'static str,
    source: String,
    chunks_deleted: usize,
    total_documents: usize,
}

async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let deleted = state.indexer.delete_source(&source_id).await?;
    let registered = state.sources.remove(&source_id);

    if deleted == 0 && !registered {
        return Err(ApiError::NotFound("Source not found".to_string()));
    }

    Ok(Json(DeleteResponse {
        status: "success",
        source: source_id,
        chunks_deleted: deleted,
        total_documents: state.indexer.count().await?,
    }))
}

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct ListResponse {
    documents: Vec<StoredDocument>,
    count: usize,
    total: usize,
}

async fn list_documents(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResponse>, ApiError> {
    let store = state.indexer.store();
    let documents = store
        .list(params.limit.unwrap_or(DEFAULT_LIST_LIMIT), params.offset.unwrap_or(0))
        .await?;

    Ok(Json(ListResponse {
        count: documents.len(),
        documents,
        total: store.count().await?,
    }))
}

// ============== Search ==============

#[derive(Deserialize)]
struct SearchRequest {
    query: Option<String>,
    top_k: Option<usize>,
    filter: Option<MetadataFilter>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<QueryMatch>,
    count: usize,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = req
        .query
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing query in request".to_string()))?;

    let results = state
        .indexer
        .search(
            &query,
            req.top_k.unwrap_or(DEFAULT_SEARCH_TOP_K),
            req.filter.as_ref().filter(|f| !f.is_empty()),
        )
        .await?;

    Ok(Json(SearchResponse {
        query,
        count: results.len(),
        results,
    }))
}

async fn search_rag(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mut req) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let started = Instant::now();
    let activity_id = activity_id(&headers);
    req.activity_id = Some(activity_id.clone());

    let answer: RagAnswer = state.engine.answer(req).await?;
    state.metrics.record_rag(started.elapsed());

    let mut response = Json(answer).into_response();
    set_activity_header(response.headers_mut(), &activity_id);
    Ok(response)
}

async fn search_rag_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Response {
    let activity_id = activity_id(&headers);
    state.metrics.record_stream_started();

    // An unreadable body still gets a well-formed stream: one error event
    let events = match payload {
        Ok(Json(mut req)) => {
            req.activity_id = Some(activity_id.clone());
            state.engine.answer_stream(req).into_stream().boxed()
        }
        Err(rejection) => {
            warn!(activity_id = %activity_id, error = %rejection.body_text(), "Rejected stream request");
            futures::stream::iter([StreamEvent::from(&QueryError::Validation(rejection.body_text()))]).boxed()
        }
    };

    let tracked = Arc::clone(&state);
    let frames = events.map(move |event| {
        match &event {
            StreamEvent::Done { .. } => tracked.metrics.record_stream_finished(true),
            StreamEvent::Error { .. } => tracked.metrics.record_stream_finished(false),
            _ => {}
        }
        query::encode_frame(&event)
    });

    let mut response = Response::new(Body::from_stream(frames));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    set_activity_header(headers, &activity_id);
    response
}

// ============== Generation & Models ==============

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: Option<String>,
    #[serde(default)]
    context: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct GenerateResponse {
    response: String,
    model: String,
    done: bool,
}

/// Direct completion without retrieval
async fn generate_text(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let prompt = req
        .prompt
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Missing prompt in request".to_string()))?;
    let full_prompt = if req.context.trim().is_empty() {
        prompt
    } else {
        format!("{}\n\n{}", req.context, prompt)
    };

    let options = GenerateOptions {
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_GENERATE_MAX_TOKENS),
        temperature: req.temperature.unwrap_or(query::llm::DEFAULT_TEMPERATURE),
    };
    let generation = state
        .generator
        .generate(&full_prompt, options)
        .await
        .map_err(|e| QueryError::classify("generator", e))?;

    Ok(Json(GenerateResponse {
        response: generation.text,
        model: state.generator.model().to_string(),
        done: generation.done,
    }))
}

#[derive(Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    current: String,
}

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelsResponse>, ApiError> {
    let models = state
        .generator
        .list_models()
        .await
        .map_err(|e| QueryError::classify("generator", e))?;

    Ok(Json(ModelsResponse {
        models,
        current: state.generator.model().to_string(),
    }))
}

#[derive(Deserialize, Default)]
struct PullRequest {
    model: Option<String>,
}

#[derive(Serialize)]
struct PullResponse {
    status: &'static str,
    model: String,
}

async fn pull_model(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<PullRequest>>,
) -> Result<Json<PullResponse>, ApiError> {
    let Json(req) = payload.unwrap_or_default();
    let model = req
        .model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.config.model_name.clone());

    state
        .generator
        .pull_model(&model)
        .await
        .map_err(|e| QueryError::classify("generator", e))?;
    info!(model = %model, "Pulled model on request");

    Ok(Json(PullResponse {
        status: "success",
        model,
    }))
}
