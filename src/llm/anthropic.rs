//! Anthropic Messages API.
//!
//! Streaming events used:
//! - `message_start`: input token count
//! - `content_block_delta` with a `text_delta`: answer text
//! - `message_delta`: cumulative output token count
//! - `message_stop`: end of answer
//! - `error`: upstream failure mid-stream (`overloaded_error` is retryable)

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    check_status, drive_stream, http_client, ChatModel, ChatRequest, Completion, StreamPiece,
};
use crate::error::ProviderError;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicChat {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl AnthropicChat {
    pub fn new(api_key: String, base_url: &str, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Anthropic API key");
        Ok(Self {
            client: http_client(PROVIDER, timeout)?,
            endpoint: format!("{}/v1/messages", base_url.trim_end_matches('/')),
            api_key,
            model,
        })
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> MessagesBody<'a> {
        MessagesBody {
            model: &self.model,
            system: &request.system,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    async fn send(&self, body: &MessagesBody<'_>) -> Result<reqwest::Response, ProviderError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(PROVIDER, e))?;
        check_status(PROVIDER, response).await
    }
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    system: &'a str,
    messages: [Message<'a>; 1],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartMessage },
    ContentBlockDelta { delta: Delta },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Error { error: ApiError },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Parse one SSE line. `event:` lines are ignored; the `data:` payload
/// carries its own `type`.
pub(crate) fn parse_line(line: &str) -> Result<Vec<StreamPiece>, ProviderError> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(Vec::new());
    };
    let event: StreamEvent = serde_json::from_str(data.trim())
        .map_err(|e| ProviderError::permanent(PROVIDER, format!("invalid stream event: {}", e)))?;

    let piece = match event {
        StreamEvent::MessageStart { message } => {
            let usage = message.usage.unwrap_or_default();
            StreamPiece::Usage {
                input: usage.input_tokens,
                output: usage.output_tokens,
            }
        }
        StreamEvent::ContentBlockDelta { delta } if delta.kind == "text_delta" => {
            StreamPiece::Delta(delta.text.unwrap_or_default())
        }
        StreamEvent::MessageDelta { usage: Some(usage) } => StreamPiece::Usage {
            input: usage.input_tokens,
            output: usage.output_tokens,
        },
        StreamEvent::MessageStop => StreamPiece::Done,
        StreamEvent::Error { error } => {
            let message = format!("{}: {}", error.kind, error.message);
            return Err(if error.kind == "overloaded_error" {
                ProviderError::transient(PROVIDER, message)
            } else {
                ProviderError::permanent(PROVIDER, message)
            });
        }
        _ => return Ok(Vec::new()),
    };
    Ok(vec![piece])
}

#[async_trait]
impl ChatModel for AnthropicChat {
    fn provider(&self) -> &str {
        PROVIDER
    }
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ChatRequest) -> Result<Completion, ProviderError> {
        let response = self.send(&self.body(request, false)).await?;
        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::permanent(PROVIDER, format!("invalid response: {}", e)))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        let usage = parsed.usage.unwrap_or_default();
        Ok(Completion {
            text,
            input_tokens: usage.input_tokens.unwrap_or(0),
            output_tokens: usage.output_tokens.unwrap_or(0),
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
