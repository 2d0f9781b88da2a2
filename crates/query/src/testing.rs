//! Scripted collaborators shared by the orchestrator tests.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use index::{Embedder, MemoryStore, VectorRecord, VectorStore};

use crate::llm::{Fragment, FragmentStream, GenerateOptions, Generation, Generator, ndjson_fragments};

/// Maps every text onto the same direction
pub struct FakeEmbedder;

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn model(&self) -> &str {
        "fake"
    }
}

/// Never answers within any sensible deadline
pub struct SlowEmbedder;

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
    }

    fn model(&self) -> &str {
        "slow"
    }
}

/// Three chunks ranked rust.md, notes.txt, rust.md for the fake query vector
pub fn seeded_store() -> Arc<dyn VectorStore> {
    let record = |id: &str, source: &str, vector: Vec<f32>, text: &str| VectorRecord {
        id: id.to_string(),
        vector,
        text: text.to_string(),
        metadata: json!({"source": source}).as_object().cloned().unwrap_or_default(),
    };

    Arc::new(MemoryStore::with_records(vec![
        record("rust.md_0", "rust.md", vec![1.0, 0.0], "Rust compiles to native code."),
        record("notes.txt_0", "notes.txt", vec![1.0, 0.5], "The borrow checker runs early."),
        record("rust.md_1", "rust.md", vec![0.2, 1.0], "Cargo drives the build."),
    ]))
}

#[derive(Debug, Clone)]
pub enum Step {
    Text(&'static str),
    Fail(&'static str),
    /// Finishing fragment carrying upstream token statistics
    Done,
    /// Stop producing without ending the stream
    Hang,
}

pub struct FakeGenerator {
    steps: Vec<Step>,
    prompts: Mutex<Vec<(String, GenerateOptions)>>,
}

impl FakeGenerator {
    pub fn new(texts: &[&'static str]) -> Self {
        let mut steps: Vec<Step> = texts.iter().map(|t| Step::Text(t)).collect();
        steps.push(Step::Done);
        Self::scripted(steps)
    }

    pub fn scripted(steps: Vec<Step>) -> Self {
        Self {
            steps,
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().ok()?.last().map(|(p, _)| p.clone())
    }

    pub fn last_options(&self) -> Option<GenerateOptions> {
        self.prompts.lock().ok()?.last().map(|(_, o)| *o)
    }

    fn record(&self, prompt: &str, options: GenerateOptions) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push((prompt.to_string(), options));
        }
    }

    fn text_count(&self) -> u64 {
        self.steps.iter().filter(|s| matches!(s, Step::Text(_))).count() as u64
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation> {
        self.record(prompt, options);
        let mut text = String::new();
        for step in &self.steps {
            match step {
                Step::Text(t) => text.push_str(t),
                Step::Fail(m) => return Err(anyhow!(*m)),
                Step::Done | Step::Hang => {}
            }
        }
        Ok(Generation {
            text,
            done: true,
            tokens_generated: Some(self.text_count()),
        })
    }

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<FragmentStream> {
        self.record(prompt, options);
        let mut items: Vec<Result<Fragment>> = Vec::new();
        let mut hang = false;

        for step in &self.steps {
            match step {
                Step::Text(t) => items.push(Ok(Fragment {
                    text: t.to_string(),
                    ..Fragment::default()
                })),
                Step::Fail(m) => items.push(Err(anyhow!(*m))),
                Step::Done => {
                    let tokens = self.text_count();
                    items.push(Ok(Fragment {
                        text: String::new(),
                        done: true,
                        tokens_generated: Some(tokens),
                        generation_duration_ns: Some(tokens * 100_000_000),
                    }));
                }
                Step::Hang => {
                    hang = true;
                    break;
                }
            }
        }

        let head = stream::iter(items);
        if hang {
            Ok(head.chain(stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }

    fn model(&self) -> &str {
        "fake"
    }
}

/// Refuses every request outright
pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> Result<Generation> {
        Err(anyhow!("connection refused"))
    }

    async fn generate_stream(&self, _prompt: &str, _options: GenerateOptions) -> Result<FragmentStream> {
        Err(anyhow!("connection refused"))
    }

    fn model(&self) -> &str {
        "failing"
    }
}

/// Replays a raw NDJSON body through the same framing the Ollama client uses
pub struct NdjsonGenerator {
    pub body: &'static str,
}

#[async_trait]
impl Generator for NdjsonGenerator {
    async fn generate(&self, _prompt: &str, _options: GenerateOptions) -> Result<Generation> {
        Err(anyhow!("single-shot not scripted"))
    }

    async fn generate_stream(&self, _prompt: &str, _options: GenerateOptions) -> Result<FragmentStream> {
        let bytes = stream::iter(vec![Ok::<_, anyhow::Error>(self.body.as_bytes().to_vec())]);
        Ok(ndjson_fragments(bytes).boxed())
    }

    fn model(&self) -> &str {
        "ndjson"
    }
}

/// Counts polls of the upstream stream and notes when it is dropped
#[derive(Default, Clone)]
pub struct UpstreamWatch {
    pub polls: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicBool>,
}

impl UpstreamWatch {
    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

struct Tracked {
    inner: FragmentStream,
    watch: UpstreamWatch,
}

impl Stream for Tracked {
    type Item = Result<Fragment>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.watch.polls.fetch_add(1, Ordering::SeqCst);
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.watch.dropped.store(true, Ordering::SeqCst);
    }
}

/// Wraps a [`FakeGenerator`] so tests can observe its upstream stream
pub struct TrackedGenerator {
    pub inner: FakeGenerator,
    pub watch: UpstreamWatch,
}

#[async_trait]
impl Generator for TrackedGenerator {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation> {
        self.inner.generate(prompt, options).await
    }

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<FragmentStream> {
        let inner = self.inner.generate_stream(prompt, options).await?;
        Ok(Tracked {
            inner,
            watch: self.watch.clone(),
        }
        .boxed())
    }

    fn model(&self) -> &str {
        "tracked"
    }
}
