use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

use crate::classifier;
use crate::error::QueryError;
use crate::llm::FragmentStream;
use crate::rag::{Plan, QueryRequest, RagEngine, Retrieval, build_prompt};
use crate::timing::{self, Timings};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplexityInfo {
    pub top_k: usize,
    pub max_tokens: u32,
    pub description: String,
}

/// One event of a streamed answer, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start {
        activity_id: String,
        sources: Vec<String>,
        complexity: ComplexityInfo,
    },
    Token {
        content: String,
    },
    Done {
        full_response: String,
        timings: Timings,
    },
    Error {
        message: String,
        code: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }
}

impl From<&QueryError> for StreamEvent {
    fn from(err: &QueryError) -> Self {
        StreamEvent::Error {
            message: err.to_string(),
            code: err.code().to_string(),
        }
    }
}

enum Phase {
    Validating(QueryRequest),
    Retrieving(Plan),
    Opening(Plan, Retrieval),
    Streaming(Box<Generating>),
    Finished,
}

struct Generating {
    plan: Plan,
    retrieval: Retrieval,
    fragments: FragmentStream,
    started: Instant,
    response: String,
    token_events: u64,
    upstream_tokens: Option<u64>,
    upstream_duration_ns: Option<u64>,
}

/// Per-request streaming state machine.
///
/// Nothing happens until the next event is requested, so the caller's polling
/// paces the upstream reads. Dropping the value drops the upstream stream.
pub struct RagStream {
    engine: RagEngine,
    activity_id: String,
    started: Instant,
    phase: Phase,
    pending: VecDeque<StreamEvent>,
}

impl RagStream {
    pub(crate) fn new(engine: RagEngine, request: QueryRequest) -> Self {
        let activity_id = request
            .activity_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Self {
            engine,
            activity_id,
            started: Instant::now(),
            phase: Phase::Validating(request),
            pending: VecDeque::new(),
        }
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Advance to the next event; `None` once a terminal event was returned
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Finished => return None,
                Phase::Validating(request) => match Plan::resolve(&request) {
                    Ok(plan) => self.phase = Phase::Retrieving(plan),
                    Err(e) => return Some(self.fail(e)),
                },
                Phase::Retrieving(plan) => match self.engine.retrieve(&plan).await {
                    Ok(retrieval) => {
                        let start = StreamEvent::Start {
                            activity_id: self.activity_id.clone(),
                            sources: retrieval.sources.clone(),
                            complexity: ComplexityInfo {
                                top_k: plan.used.top_k,
                                max_tokens: plan.used.max_tokens,
                                description: classifier::describe(plan.used.top_k).to_string(),
                            },
                        };
                        self.phase = Phase::Opening(plan, retrieval);
                        return Some(start);
                    }
                    Err(e) => return Some(self.fail(e)),
                },
                Phase::Opening(plan, retrieval) => match open(&self.engine, &plan, &retrieval).await {
                    Ok(fragments) => {
                        self.phase = Phase::Streaming(Box::new(Generating {
                            plan,
                            retrieval,
                            fragments,
                            started: Instant::now(),
                            response: String::new(),
                            token_events: 0,
                            upstream_tokens: None,
                            upstream_duration_ns: None,
                        }));
                    }
                    Err(e) => return Some(self.fail(e)),
                },
                Phase::Streaming(mut generating) => {
                    let fragment_timeout = self.engine.config().fragment_timeout;
                    match tokio::time::timeout(fragment_timeout, generating.fragments.next()).await {
                        Err(_) => {
                            return Some(self.fail(QueryError::UpstreamTimeout {
                                service: "generator",
                            }));
                        }
                        Ok(Some(Err(e))) => {
                            return Some(self.fail(QueryError::classify("generator", e)));
                        }
                        Ok(Some(Ok(fragment))) => {
                            if !fragment.text.is_empty() {
                                generating.response.push_str(&fragment.text);
                                generating.token_events += 1;
                                self.pending.push_back(StreamEvent::Token {
                                    content: fragment.text,
                                });
                            }
                            if fragment.tokens_generated.is_some() {
                                generating.upstream_tokens = fragment.tokens_generated;
                            }
                            if fragment.generation_duration_ns.is_some() {
                                generating.upstream_duration_ns = fragment.generation_duration_ns;
                            }

                            if fragment.done {
                                let done = self.complete(*generating);
                                self.pending.push_back(done);
                            } else {
                                self.phase = Phase::Streaming(generating);
                            }
                        }
                        // An upstream that just stops is taken as finished
                        Ok(None) => return Some(self.complete(*generating)),
                    }
                }
            }
        }
    }

    /// Drive the state machine as a `Stream` of events
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        stream::unfold(self, |mut state| async move {
            state.next_event().await.map(|event| (event, state))
        })
    }

    fn fail(&mut self, err: QueryError) -> StreamEvent {
        warn!(activity_id = %self.activity_id, code = err.code(), error = %err, "Stream failed");
        self.phase = Phase::Finished;
        StreamEvent::from(&err)
    }

    fn complete(&mut self, generating: Generating) -> StreamEvent {
        self.phase = Phase::Finished;
        let elapsed = generating.started.elapsed();

        let mut timings = generating.retrieval.timings(&generating.plan);
        timings.generation_ms = timing::millis(elapsed);
        timings.total_ms = timing::millis(self.started.elapsed());

        let (tokens, rate) = match (generating.upstream_tokens, generating.upstream_duration_ns) {
            (Some(count), Some(ns)) if ns > 0 => (
                Some(count),
                timing::tokens_per_sec(Some(count), Duration::from_nanos(ns)),
            ),
            (upstream, _) => {
                let count = upstream.unwrap_or(generating.token_events);
                (Some(count), timing::tokens_per_sec(Some(count), elapsed))
            }
        };
        timings.tokens_generated = tokens;
        timings.tokens_per_sec = rate;

        info!(
            activity_id = %self.activity_id,
            tokens = tokens.unwrap_or(0),
            total_ms = timings.total_ms,
            "Stream completed"
        );

        StreamEvent::Done {
            full_response: generating.response,
            timings,
        }
    }
}

/// Takes the engine rather than the whole stream so the future stays `Send`;
/// the upstream `FragmentStream` is not `Sync`.
async fn open(engine: &RagEngine, plan: &Plan, retrieval: &Retrieval) -> Result<FragmentStream, QueryError> {
    let prompt = build_prompt(&retrieval.context, &plan.query);
    crate::rag::bounded(
        "generator",
        engine.config().generation_timeout,
        engine.generator().generate_stream(&prompt, plan.options()),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag::RagConfig;
    use crate::testing::{
        FailingGenerator, FakeEmbedder, FakeGenerator, NdjsonGenerator, SlowEmbedder, Step, TrackedGenerator,
        UpstreamWatch, seeded_store,
    };
    use crate::llm::Generator;
    use index::Embedder;
    use std::sync::Arc;

    fn engine_with(embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>, config: RagConfig) -> RagEngine {
        RagEngine::new(embedder, seeded_store(), generator, config)
    }

    fn engine(generator: Arc<dyn Generator>) -> RagEngine {
        engine_with(Arc::new(FakeEmbedder), generator, RagConfig::default())
    }

    async fn collect(engine: &RagEngine, request: QueryRequest) -> Vec<StreamEvent> {
        engine.answer_stream(request).into_stream().collect().await
    }

    fn request(query: &str) -> QueryRequest {
        let mut request = QueryRequest::new(query);
        request.activity_id = Some("act-1".to_string());
        request
    }

    #[tokio::test]
    async fn test_stream_shape_and_tokens_concatenate() {
        let engine = engine(Arc::new(FakeGenerator::new(&["Rust ", "is ", "fast."])));
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 5);
        match &events[0] {
            StreamEvent::Start {
                activity_id,
                sources,
                complexity,
            } => {
                assert_eq!(activity_id, "act-1");
                assert_eq!(sources, &vec!["rust.md".to_string(), "notes.txt".to_string()]);
                assert_eq!(complexity.top_k, 3);
                assert_eq!(complexity.max_tokens, 128);
                assert_eq!(complexity.description, "simple");
            }
            other => panic!("expected start, got {:?}", other),
        }

        let tokens: String = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect();

        match events.last().unwrap() {
            StreamEvent::Done {
                full_response,
                timings,
            } => {
                assert_eq!(full_response, &tokens);
                assert_eq!(full_response, "Rust is fast.");
                assert_eq!(timings.tokens_generated, Some(3));
                // 3 tokens over 0.3s of upstream time
                assert_eq!(timings.tokens_per_sec, Some(10.0));
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_trivial_query_streams_without_context() {
        let engine = engine(Arc::new(FakeGenerator::new(&["Hi there"])));
        let events = collect(&engine, request("hello")).await;

        match &events[0] {
            StreamEvent::Start {
                sources,
                complexity,
                ..
            } => {
                assert!(sources.is_empty());
                assert_eq!(complexity.description, "trivial (no context)");
            }
            other => panic!("expected start, got {:?}", other),
        }
        match events.last().unwrap() {
            StreamEvent::Done { timings, .. } => {
                assert!(timings.skipped_context);
                assert_eq!(timings.context_chars, 0);
                assert_eq!(timings.embedding_ms, 0.0);
                assert_eq!(timings.retrieval_ms, 0.0);
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_query_yields_lone_error() {
        let engine = engine(Arc::new(FakeGenerator::new(&["unused"])));
        let events = collect(&engine, QueryRequest::default()).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { code, .. } if code == "bad_request"));
    }

    #[tokio::test]
    async fn test_retrieval_timeout_yields_lone_error() {
        let config = RagConfig {
            embed_timeout: Duration::from_millis(20),
            ..RagConfig::default()
        };
        let engine = engine_with(
            Arc::new(SlowEmbedder),
            Arc::new(FakeGenerator::new(&["unused"])),
            config,
        );
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error { code, .. } if code == "timeout"));
    }

    #[tokio::test]
    async fn test_open_failure_after_start() {
        let engine = engine(Arc::new(FailingGenerator));
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert!(matches!(&events[1], StreamEvent::Error { code, .. } if code == "upstream_error"));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_ends_with_error() {
        let generator = FakeGenerator::scripted(vec![Step::Text("partial"), Step::Fail("reset by peer")]);
        let engine = engine(Arc::new(generator));
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 3);
        assert_eq!(
            events[1],
            StreamEvent::Token {
                content: "partial".to_string()
            }
        );
        match &events[2] {
            StreamEvent::Error { message, code } => {
                assert_eq!(code, "upstream_error");
                assert!(message.contains("reset by peer"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inline_upstream_error_ends_with_error() {
        let generator = NdjsonGenerator {
            body: "{\"response\":\"Par\"}\n{\"error\":\"model runner has unexpectedly stopped\"}\n",
        };
        let engine = engine(Arc::new(generator));
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], StreamEvent::Start { .. }));
        assert_eq!(
            events[1],
            StreamEvent::Token {
                content: "Par".to_string()
            }
        );
        match &events[2] {
            StreamEvent::Error { message, code } => {
                assert_eq!(code, "upstream_error");
                assert!(message.contains("unexpectedly stopped"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_upstream() {
        let watch = UpstreamWatch::default();
        let generator = TrackedGenerator {
            inner: FakeGenerator::new(&["one ", "two ", "three"]),
            watch: watch.clone(),
        };
        let engine = engine(Arc::new(generator));
        let mut stream = engine.answer_stream(request("explain the rust compiler"));

        assert!(matches!(stream.next_event().await, Some(StreamEvent::Start { .. })));
        assert_eq!(
            stream.next_event().await,
            Some(StreamEvent::Token {
                content: "one ".to_string()
            })
        );
        assert_eq!(watch.polls(), 1);
        assert!(!watch.dropped());

        drop(stream);
        assert!(watch.dropped());
        assert_eq!(watch.polls(), 1);
    }

    #[tokio::test]
    async fn test_fragment_timeout() {
        let config = RagConfig {
            fragment_timeout: Duration::from_millis(20),
            ..RagConfig::default()
        };
        let generator = FakeGenerator::scripted(vec![Step::Text("slow"), Step::Hang]);
        let engine = engine_with(Arc::new(FakeEmbedder), Arc::new(generator), config);
        let events = collect(&engine, request("explain the rust compiler")).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[2], StreamEvent::Error { code, .. } if code == "timeout"));
    }

    #[tokio::test]
    async fn test_stream_without_done_flag_completes() {
        let generator = FakeGenerator::scripted(vec![Step::Text("a"), Step::Text("b")]);
        let engine = engine(Arc::new(generator));
        let events = collect(&engine, request("explain the rust compiler")).await;

        match events.last().unwrap() {
            StreamEvent::Done {
                full_response,
                timings,
            } => {
                assert_eq!(full_response, "ab");
                assert_eq!(timings.tokens_generated, Some(2));
            }
            other => panic!("expected done, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nothing_after_terminal_event() {
        let engine = engine(Arc::new(FakeGenerator::new(&["x"])));
        let mut stream = engine.answer_stream(request("hi"));
        let mut terminal_seen = false;

        while let Some(event) = stream.next_event().await {
            assert!(!terminal_seen);
            terminal_seen = event.is_terminal();
        }
        assert!(terminal_seen);
        assert!(stream.next_event().await.is_none());
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_event_stream_is_send() {
        let engine = engine(Arc::new(FakeGenerator::new(&["x"])));
        let events = engine.answer_stream(QueryRequest::new("hi")).into_stream();
        assert_send(&events);

        let mut stream = engine.answer_stream(QueryRequest::new("hi"));
        assert_send(&stream.next_event());
    }

    #[test]
    fn test_generated_activity_id() {
        let engine = engine(Arc::new(FakeGenerator::new(&[])));
        let stream = engine.answer_stream(QueryRequest::new("hi"));
        assert!(Uuid::parse_str(stream.activity_id()).is_ok());
    }
}
