//! OpenAI-compatible provider
//!
//! Works with any API that implements the OpenAI chat completions format
//! with `stream: true` (Server-Sent Events):
//! - OpenAI (api.openai.com)
//! - Volcengine Ark, DeepSeek, Groq
//! - vLLM / LM Studio / LocalAI (local servers)
//!
//! # Configuration
//!
//! ```toml
//! [llm]
//! provider = "openai"
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o-mini"
//! ```

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::Message;

use super::{buffer_chunk, split_frames, FragmentStream, ProviderError};

/// OpenAI-compatible chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

/// Chat completion request
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// One `data:` payload of the completion stream
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// What a single stream payload means for the reply
#[derive(Debug, PartialEq)]
enum StreamEvent {
    /// Reply text; `finished` once the model reports a finish reason
    Delta { text: String, finished: bool },
    /// The `[DONE]` sentinel
    Done,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., https://api.openai.com/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
    /// Default model to use
    pub default_model: String,
    /// Optional organization ID (OpenAI)
    pub organization: Option<String>,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAICompatConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            default_model: "gpt-4o-mini".to_string(),
            organization: None,
            timeout_secs: 120,
        }
    }
}

impl OpenAICompatConfig {
    /// Create config for OpenAI
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    /// Create a new provider with the given configuration
    pub fn new(config: OpenAICompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Start a streamed chat completion
    pub async fn stream_chat(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<FragmentStream, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let request = ChatCompletionRequest {
            model: if model.is_empty() {
                self.config.default_model.clone()
            } else {
                model.to_string()
            },
            messages: messages.iter().map(ChatMessage::from).collect(),
            stream: true,
            temperature: None,
            max_tokens: None,
        };

        debug!("Streaming chat request to {} with model {}", url, request.model);

        let mut req_builder = self.client.post(&url);

        // Add authorization if API key is provided
        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.bearer_auth(api_key);
        }

        // Add organization header if provided (OpenAI specific)
        if let Some(ref org) = self.config.organization {
            req_builder = req_builder.header("OpenAI-Organization", org);
        }

        let response = req_builder.json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(&body) {
                return Err(ProviderError::Api(error_resp.error.message));
            }
            return Err(ProviderError::Api(format!("HTTP {}: {}", status, body)));
        }

        Ok(sse_fragments(response.bytes_stream()))
    }
}

/// Turn a Server-Sent-Events body into reply fragments. A body that ends
/// before `[DONE]` or a `finish_reason` yields [`ProviderError::Interrupted`].
fn sse_fragments<S, B>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer = Vec::new();
        let mut finished = false;

        'read: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ProviderError::RequestFailed(e));
                    return;
                }
            };
            buffer_chunk(&mut buffer, chunk.as_ref());

            for frame in split_frames(&mut buffer, b"\n\n") {
                let payload = match sse_data(&frame) {
                    Some(payload) => payload,
                    None => continue,
                };
                match parse_payload(&payload) {
                    Ok(StreamEvent::Done) => {
                        finished = true;
                        break 'read;
                    }
                    Ok(StreamEvent::Delta { text, finished: last }) => {
                        finished |= last;
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        if !finished {
            yield Err(ProviderError::Interrupted);
        }
    };

    Box::pin(stream)
}

/// Join the `data:` lines of one SSE event. Comments and other fields are
/// ignored; `None` when the event carries no data.
fn sse_data(frame: &str) -> Option<String> {
    let lines: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

fn parse_payload(payload: &str) -> Result<StreamEvent, ProviderError> {
    if payload.trim() == "[DONE]" {
        return Ok(StreamEvent::Done);
    }

    let chunk: StreamChunk = serde_json::from_str(payload).map_err(|e| {
        ProviderError::InvalidResponse(format!(
            "Failed to parse stream chunk: {} - Data: {}",
            e, payload
        ))
    })?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Api(error.message));
    }

    let mut text = String::new();
    let mut finished = false;
    for choice in chunk.choices {
        if let Some(content) = choice.delta.content {
            text.push_str(&content);
        }
        finished |= choice.finish_reason.is_some();
    }

    Ok(StreamEvent::Delta { text, finished })
}
