//! Chat model capability and backends.
//!
//! [`ChatModel`] is the seam the query orchestrator talks to. Each backend
//! offers a one-shot [`ChatModel::complete`] and a streaming
//! [`ChatModel::stream`] that pushes text increments into an `mpsc` channel
//! as they arrive and stops reading the upstream body once the receiver is
//! gone.
//!
//! | Provider | Module | Endpoint |
//! |----------|--------|----------|
//! | `openai` | [`openai`] | `POST {base}/v1/chat/completions` (SSE) |
//! | `anthropic` | [`anthropic`] | `POST {base}/v1/messages` (SSE) |
//! | `ollama` | [`ollama`] | `POST {base}/api/chat` (NDJSON) |
//!
//! [`ProviderFactory`] builds and caches one client per `(provider, model)`.

pub mod anthropic;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::chunk::CHARS_PER_TOKEN;
use crate::config::ProvidersConfig;
use crate::error::ProviderError;

pub use anthropic::AnthropicChat;
pub use ollama::OllamaChat;
pub use openai::OpenAIChat;

/// One grounded question for a chat model.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Completion {
    /// Fill token counts the provider did not report from text length.
    fn with_estimates(mut self, request: &ChatRequest) -> Self {
        if self.input_tokens == 0 {
            self.input_tokens = estimate(&request.system) + estimate(&request.prompt);
        }
        if self.output_tokens == 0 && !self.text.is_empty() {
            self.output_tokens = estimate(&self.text);
        }
        self
    }
}

fn estimate(text: &str) -> u64 {
    text.len().div_ceil(CHARS_PER_TOKEN) as u64
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Provider name, e.g. `"anthropic"`.
    fn provider(&self) -> &str;
    fn model(&self) -> &str;

    /// Generate the full answer in one response.
    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError>;

    /// Stream the answer, sending each text increment to `tx`. Returns the
    /// accumulated completion; if `tx` is closed the upstream read stops
    /// and the partial completion is returned.
    async fn stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, ProviderError>;
}

// ============ Stream plumbing ============

/// What one upstream line contributed.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StreamPiece {
    Delta(String),
    Usage {
        input: Option<u64>,
        output: Option<u64>,
    },
    Done,
}

/// Splits a byte stream into lines. Bytes are buffered until a newline, so
/// multi-byte characters split across network chunks decode intact.
#[derive(Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
            if !text.is_empty() {
                lines.push(text.to_string());
            }
        }
        lines
    }

    /// Whatever remains after the body ends without a trailing newline.
    pub(crate) fn finish(&mut self) -> Option<String> {
        let rest = String::from_utf8_lossy(&self.pending).trim().to_string();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

type LineParser = fn(&str) -> Result<Vec<StreamPiece>, ProviderError>;

/// Read a streaming response line by line, forwarding deltas to `tx`.
pub(crate) async fn drive_stream(
    provider: &str,
    response: reqwest::Response,
    tx: &mpsc::Sender<String>,
    parse: LineParser,
) -> Result<Completion, ProviderError> {
    let mut completion = Completion::default();
    let mut lines = LineBuffer::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| ProviderError::from_reqwest(provider, e))?;
        for line in lines.push(&chunk) {
            if !apply_line(&line, parse, &mut completion, tx).await? {
                return Ok(completion);
            }
        }
    }
    if let Some(line) = lines.finish() {
        apply_line(&line, parse, &mut completion, tx).await?;
    }
    Ok(completion)
}

/// Returns `false` when reading should stop.
async fn apply_line(
    line: &str,
    parse: LineParser,
    completion: &mut Completion,
    tx: &mpsc::Sender<String>,
) -> Result<bool, ProviderError> {
    for piece in parse(line)? {
        match piece {
            StreamPiece::Delta(text) => {
                if text.is_empty() {
                    continue;
                }
                completion.text.push_str(&text);
                if tx.send(text).await.is_err() {
                    tracing::debug!("stream receiver dropped; closing upstream");
                    return Ok(false);
                }
            }
            StreamPiece::Usage { input, output } => {
                if let Some(input) = input {
                    completion.input_tokens = input;
                }
                if let Some(output) = output {
                    completion.output_tokens = output;
                }
            }
            StreamPiece::Done => return Ok(false),
        }
    }
    Ok(true)
}

/// Shared HTTP response check for the one-shot and streaming paths.
pub(crate) async fn check_status(
    provider: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::from_status(provider, status, &body))
}

pub(crate) fn http_client(provider: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .with_context(|| format!("failed to build {} HTTP client", provider))
}

// ============ Factory ============

/// Builds chat clients on demand and caches them by `(provider, model)`.
pub struct ProviderFactory {
    providers: ProvidersConfig,
    cache: Mutex<HashMap<(String, String), Arc<dyn ChatModel>>>,
}

impl ProviderFactory {
    pub fn new(providers: ProvidersConfig) -> Self {
        Self {
            providers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Seed the cache with a ready-made model, keyed by its own provider and model names.
    pub fn with_model(self, model: Arc<dyn ChatModel>) -> Self {
        self.insert(model);
        self
    }

    pub fn insert(&self, model: Arc<dyn ChatModel>) {
        let key = (model.provider().to_string(), model.model().to_string());
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(key, model);
    }

    pub fn get(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ProviderError> {
        let key = (provider.to_string(), model.to_string());
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }
        let built = self.build(provider, model)?;
        tracing::debug!(provider, model, "created chat client");
        cache.insert(key, built.clone());
        Ok(built)
    }

    fn build(&self, provider: &str, model: &str) -> Result<Arc<dyn ChatModel>, ProviderError> {
        let base_url = self.providers.base_url(provider);
        let timeout = Duration::from_secs(self.providers.timeout_secs(provider));
        let not_configured = || ProviderError::NotConfigured(provider.to_string());
        let build_failed = |e: anyhow::Error| ProviderError::permanent(provider, format!("{:#}", e));

        let chat: Arc<dyn ChatModel> = match provider {
            "openai" => {
                let key = self.providers.api_key("openai").ok_or_else(not_configured)?;
                Arc::new(
                    OpenAIChat::new(key, &base_url, model.to_string(), timeout)
                        .map_err(build_failed)?,
                )
            }
            "anthropic" => {
                let key = self.providers.api_key("anthropic").ok_or_else(not_configured)?;
                Arc::new(
                    AnthropicChat::new(key, &base_url, model.to_string(), timeout)
                        .map_err(build_failed)?,
                )
            }
            "ollama" => Arc::new(
                OllamaChat::new(&base_url, model.to_string(), timeout).map_err(build_failed)?,
            ),
            _ => return Err(not_configured()),
        };
        Ok(chat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ChatModel for Fixed {
        fn provider(&self) -> &str {
            "openai"
        }
        fn model(&self) -> &str {
            "fixed"
        }
        async fn complete(&self, _request: &ChatRequest) -> Result<Completion, ProviderError> {
            Ok(Completion::default())
        }
        async fn stream(
            &self,
            _request: &ChatRequest,
            _tx: mpsc::Sender<String>,
        ) -> Result<Completion, ProviderError> {
            Ok(Completion::default())
        }
    }

    #[test]
    fn test_line_buffer_handles_split_lines_and_utf8() {
        let mut buf = LineBuffer::default();
        assert!(buf.push(b"data: hel").is_empty());
        let lines = buf.push(b"lo\r\n\ndata: caf\xc3");
        assert_eq!(lines, vec!["data: hello"]);
        let lines = buf.push(b"\xa9\n");
        assert_eq!(lines, vec!["data: café"]);
        buf.push(b"tail");
        assert_eq!(buf.finish(), Some("tail".to_string()));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn test_estimates_fill_missing_usage() {
        let request = ChatRequest {
            system: "abcd".to_string(),
            prompt: "abcdefgh".to_string(),
            temperature: 0.0,
            max_tokens: 10,
        };
        let completion = Completion {
            text: "abcde".to_string(),
            ..Default::default()
        }
        .with_estimates(&request);
        assert_eq!(completion.input_tokens, 3);
        assert_eq!(completion.output_tokens, 2);

        let reported = Completion {
            text: "abcde".to_string(),
            input_tokens: 40,
            output_tokens: 7,
        }
        .with_estimates(&request);
        assert_eq!(reported.input_tokens, 40);
        assert_eq!(reported.output_tokens, 7);
    }

    #[test]
    fn test_factory_returns_seeded_model() {
        let factory = ProviderFactory::new(ProvidersConfig::default()).with_model(Arc::new(Fixed));
        let model = factory.get("openai", "fixed").unwrap();
        assert_eq!(model.model(), "fixed");
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let factory = ProviderFactory::new(ProvidersConfig::default());
        let err = factory.get("mystery", "m").err().unwrap();
        assert_eq!(err, ProviderError::NotConfigured("mystery".to_string()));
    }

    #[test]
    fn test_factory_caches_ollama_clients() {
        let factory = ProviderFactory::new(ProvidersConfig::default());
        let a = factory.get("ollama", "llama3").unwrap();
        let b = factory.get("ollama", "llama3").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = factory.get("ollama", "mistral").unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
