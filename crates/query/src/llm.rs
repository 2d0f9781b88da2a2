use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::QueryError;

pub const DEFAULT_MODEL: &str = "qwen2.5:3b";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerateOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_tokens: 128,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

/// A finished single-shot completion
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub done: bool,
    pub tokens_generated: Option<u64>,
}

/// One piece of a streamed completion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub text: String,
    pub done: bool,
    pub tokens_generated: Option<u64>,
    /// Upstream-measured generation time in nanoseconds
    pub generation_duration_ns: Option<u64>,
}

pub type FragmentStream = BoxStream<'static, Result<Fragment>>;

/// Text generation collaborator
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation>;

    /// Open a streamed completion. Dropping the returned stream abandons the
    /// upstream request.
    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<FragmentStream>;

    fn model(&self) -> &str;

    async fn is_available(&self) -> bool {
        true
    }

    /// Models the backend can serve
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec![self.model().to_string()])
    }

    /// Fetch a model onto the backend; backends without model management
    /// accept the request as a no-op.
    async fn pull_model(&self, model: &str) -> Result<()> {
        debug!(model = %model, "Pull not supported, ignoring");
        Ok(())
    }
}

#[derive(Clone)]
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    client: reqwest::Client,
    /// No whole-request timeout, or long answers would be cut off; fragment
    /// deadlines are enforced by the caller instead.
    stream_client: reqwest::Client,
    pull_timeout: Duration,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    eval_count: Option<u64>,
    eval_duration: Option<u64>,
    /// Set when the server fails after the response status was already sent
    error: Option<String>,
}

impl From<OllamaResponse> for Fragment {
    fn from(r: OllamaResponse) -> Self {
        Fragment {
            text: r.response,
            done: r.done,
            tokens_generated: r.eval_count,
            generation_duration_ns: r.eval_duration,
        }
    }
}

impl OllamaGenerator {
    pub fn new(base_url: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build Ollama HTTP client")?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build Ollama streaming client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            client,
            stream_client,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        })
    }

    pub fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    async fn send(
        &self,
        client: &reqwest::Client,
        prompt: &str,
        options: GenerateOptions,
        stream: bool,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/api/generate", self.base_url);
        let request = OllamaRequest {
            model: &self.model,
            prompt,
            stream,
            options: OllamaOptions {
                num_predict: options.max_tokens,
                temperature: options.temperature,
            },
        };

        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama request failed ({}): {}", status, body);
        }

        Ok(response)
    }

    /// Pull the configured model if the server does not have it yet
    pub async fn ensure_model(&self) -> Result<()> {
        let models = self.list_models().await?;
        if models.iter().any(|name| name == &self.model) {
            return Ok(());
        }
        info!(model = %self.model, "Model not found, pulling");
        self.pull_model(&self.model).await
    }

    /// Make sure the model exists, then load it into memory with a one-token
    /// completion
    pub async fn warmup(&self) -> Result<()> {
        self.ensure_model().await?;
        let options = GenerateOptions {
            max_tokens: 1,
            temperature: 0.0,
        };
        self.generate("hi", options).await?;
        info!(model = %self.model, "Model warmed up");
        Ok(())
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str, options: GenerateOptions) -> Result<Generation> {
        let response: OllamaResponse = self
            .send(&self.client, prompt, options, false)
            .await?
            .json()
            .await
            .context("Failed to parse Ollama response")?;
        if let Some(message) = response.error {
            return Err(generator_error(message));
        }

        Ok(Generation {
            text: response.response,
            done: response.done,
            tokens_generated: response.eval_count,
        })
    }

    async fn generate_stream(&self, prompt: &str, options: GenerateOptions) -> Result<FragmentStream> {
        let response = self.send(&self.stream_client, prompt, options, true).await?;
        debug!(model = %self.model, "Opened Ollama stream");

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.context("Ollama stream interrupted"));
        Ok(ndjson_fragments(bytes).boxed())
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn is_available(&self) -> bool {
        self.list_models().await.is_ok()
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<Model>,
        }
        #[derive(Deserialize)]
        struct Model {
            name: String,
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await.context("Failed to reach Ollama")?;
        if !response.status().is_success() {
            anyhow::bail!("Ollama tags request failed: {}", response.status());
        }
        let tags: Tags = response.json().await.context("Failed to parse Ollama tags")?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    async fn pull_model(&self, model: &str) -> Result<()> {
        let url = format!("{}/api/pull", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .timeout(self.pull_timeout)
            .json(&serde_json::json!({ "name": model, "stream": false }))
            .send()
            .await
            .context("Failed to send pull request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama pull of {} failed ({}): {}", model, status, body);
        }

        info!(model = %model, "Model pulled");
        Ok(())
    }
}

/// Re-frame a byte stream into one [`Fragment`] per newline-delimited JSON
/// object. Network chunks may split a line or carry several.
pub fn ndjson_fragments<S, B>(bytes: S) -> impl futures::Stream<Item = Result<Fragment>> + Send + 'static
where
    S: futures::Stream<Item = Result<B>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    struct State<B> {
        bytes: BoxStream<'static, Result<B>>,
        buffer: Vec<u8>,
        finished: bool,
    }

    let state = State {
        bytes: bytes.boxed(),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Some(item) => return Some((item, state)),
                    None => continue,
                }
            }

            if state.finished {
                // Trailing object without a final newline
                let rest = std::mem::take(&mut state.buffer);
                return parse_line(&rest).map(|item| (item, state));
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => {
                    state.finished = true;
                    state.buffer.clear();
                    return Some((Err(e), state));
                }
                None => state.finished = true,
            }
        }
    })
}

fn parse_line(line: &[u8]) -> Option<Result<Fragment>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    let mut response = match serde_json::from_slice::<OllamaResponse>(trimmed) {
        Ok(response) => response,
        Err(e) => return Some(Err(QueryError::MalformedFragment(e.to_string()).into())),
    };
    match response.error.take() {
        Some(message) => Some(Err(generator_error(message))),
        None => Some(Ok(Fragment::from(response))),
    }
}

fn generator_error(message: String) -> anyhow::Error {
    QueryError::Upstream {
        service: "generator",
        message,
    }
    .into()
}
