//! Local Ollama chat. Streams newline-delimited JSON objects.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    check_status, drive_stream, http_client, ChatModel, ChatRequest, Completion, StreamPiece,
};
use crate::error::ProviderError;

const PROVIDER: &str = "ollama";

pub struct OllamaChat {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaChat {
    pub fn new(url: &str, model: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http_client(PROVIDER, timeout)?,
            url: url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "stream": stream,
            "options": {
                "temperature": request.temperature,
                "num_predict": request.max_tokens,
            },
        })
    }

    async fn send(&self, body: &serde_json::Value) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(format!("{}/api/chat", self.url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::transient(
                    PROVIDER,
                    format!("connection error (is Ollama running at {}?): {}", self.url, e),
                )
            })?;
        check_status(PROVIDER, response).await
    }
}

#[derive(Debug, Deserialize)]
struct ChatLine {
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
}

fn parse_chat_line(line: &str) -> Result<ChatLine, ProviderError> {
    let parsed: ChatLine = serde_json::from_str(line)
        .map_err(|e| ProviderError::permanent(PROVIDER, format!("invalid response line: {}", e)))?;
    if let Some(error) = &parsed.error {
        return Err(ProviderError::permanent(PROVIDER, error.clone()));
    }
    Ok(parsed)
}

pub(crate) fn parse_line(line: &str) -> Result<Vec<StreamPiece>, ProviderError> {
    let parsed = parse_chat_line(line)?;
    let mut pieces = Vec::new();
    if let Some(message) = parsed.message {
        pieces.push(StreamPiece::Delta(message.content));
    }
    if parsed.done {
        pieces.push(StreamPiece::Usage {
            input: parsed.prompt_eval_count,
            output: parsed.eval_count,
        });
        pieces.push(StreamPiece::Done);
    }
    Ok(pieces)
}

#[async_trait]
impl ChatModel for OllamaChat {
    fn provider(&self) -> &str {
        PROVIDER
    }
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let response = self.send(&self.body(request, false)).await?;
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        let parsed = parse_chat_line(body.trim())?;
        Ok(Completion {
            text: parsed.message.map(|m| m.content).unwrap_or_default(),
            input_tokens: parsed.prompt_eval_count.unwrap_or(0),
            output_tokens: parsed.eval_count.unwrap_or(0),
        }
        .with_estimates(request))
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion, ProviderError> {
        let response = self.send(&self.body(request, true)).await?;
        let completion = drive_stream(PROVIDER, response, &tx, parse_line).await?;
        Ok(completion.with_estimates(request))
    }
}
