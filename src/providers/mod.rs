//! Remote model integrations
//!
//! Every provider exposes the same pull-based contract: send the ordered
//! request messages, get back a stream of reply fragments. The fragments
//! concatenate to the full reply; an `Err` item ends the reply early.

mod ollama;
mod openai_compat;
#[cfg(test)]
pub mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::config::Config;
use crate::conversation::Message;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Stream ended before the reply was complete")]
    Interrupted,
}

/// Reply fragments in arrival order.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

/// A streaming chat-completion service
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a streamed completion for `messages`. An empty `model` means the
    /// provider's default.
    async fn stream_chat(&self, messages: &[Message], model: &str)
        -> Result<FragmentStream, ProviderError>;
}

pub enum Provider {
    OpenAICompat(OpenAICompatProvider),
    Ollama(OllamaProvider),
}

impl Provider {
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        match config.provider.to_lowercase().as_str() {
            "openai" | "openai_compat" => {
                let compat = match (&config.base_url, &config.openai_api_key) {
                    (Some(base_url), api_key) => OpenAICompatConfig {
                        base_url: base_url.clone(),
                        api_key: api_key.clone(),
                        default_model: config.model.clone(),
                        organization: None,
                        timeout_secs: config.timeout_secs,
                    },
                    (None, Some(api_key)) => OpenAICompatConfig {
                        default_model: config.model.clone(),
                        timeout_secs: config.timeout_secs,
                        ..OpenAICompatConfig::openai(api_key.clone())
                    },
                    (None, None) => {
                        return Err(ProviderError::NotConfigured(
                            "base_url or openai_api_key".into(),
                        ))
                    }
                };
                Ok(Provider::OpenAICompat(OpenAICompatProvider::new(compat)?))
            }
            "ollama" => {
                let url = config
                    .ollama_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".into());
                Ok(Provider::Ollama(OllamaProvider::new(url, config.model.clone())))
            }
            _ => Err(ProviderError::UnknownProvider(config.provider.clone())),
        }
    }
}

#[async_trait]
impl CompletionProvider for Provider {
    async fn stream_chat(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<FragmentStream, ProviderError> {
        match self {
            Provider::OpenAICompat(p) => p.stream_chat(messages, model).await,
            Provider::Ollama(p) => p.stream_chat(messages, model).await,
        }
    }
}

/// Split complete frames off the front of `buffer`.
///
/// Frames end with `delimiter`; a trailing partial frame stays buffered for
/// the next network chunk. Works on bytes so a multi-byte character split
/// across two chunks is only decoded once it is whole. Carriage returns are
/// expected to have been dropped on the way in.
fn split_frames(buffer: &mut Vec<u8>, delimiter: &[u8]) -> Vec<String> {
    let mut frames = Vec::new();
    while let Some(pos) = buffer
        .windows(delimiter.len())
        .position(|window| window == delimiter)
    {
        let frame: Vec<u8> = buffer.drain(..pos + delimiter.len()).take(pos).collect();
        frames.push(String::from_utf8_lossy(&frame).into_owned());
    }
    frames
}

/// Append a network chunk to `buffer`, dropping `\r` so CRLF and LF framing
/// look the same.
fn buffer_chunk(buffer: &mut Vec<u8>, chunk: &[u8]) {
    buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
}
