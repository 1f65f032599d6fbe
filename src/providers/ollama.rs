//! Ollama provider implementation
//!
//! Uses `/api/chat` with `stream: true`, which answers with one JSON object
//! per line until an object with `"done": true`.

use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::Message;

use super::{buffer_chunk, split_frames, FragmentStream, ProviderError};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
    default_model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OllamaChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaProvider {
    pub fn new(base_url: String, default_model: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            default_model,
        }
    }

    pub async fn stream_chat(
        &self,
        messages: &[Message],
        model: &str,
    ) -> Result<FragmentStream, ProviderError> {
        let ollama_messages: Vec<OllamaMessage> = messages
            .iter()
            .map(|m| OllamaMessage {
                role: m.role.as_str().to_string(),
                content: m.content.clone(),
            })
            .collect();

        let request = OllamaRequest {
            model: if model.is_empty() {
                self.default_model.clone()
            } else {
                model.to_string()
            },
            messages: ollama_messages,
            stream: true,
        };

        debug!("Streaming chat request to Ollama with model {}", request.model);

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{}: {}", status, body)));
        }

        Ok(ndjson_fragments(response.bytes_stream()))
    }
}

/// Turn an NDJSON body into reply fragments. A body that ends before a line
/// with `"done": true` yields [`ProviderError::Interrupted`].
fn ndjson_fragments<S, B>(bytes: S) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer = Vec::new();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ProviderError::RequestFailed(e));
                    return;
                }
            };
            buffer_chunk(&mut buffer, chunk.as_ref());

            for line in split_frames(&mut buffer, b"\n") {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_line(&line) {
                    Ok((text, done)) => {
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                        if done {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        }

        yield Err(ProviderError::Interrupted);
    };

    Box::pin(stream)
}

/// Decode one NDJSON line into its text and the `done` flag.
fn parse_line(line: &str) -> Result<(String, bool), ProviderError> {
    let chunk: OllamaChunk = serde_json::from_str(line)
        .map_err(|e| ProviderError::InvalidResponse(format!("{} - Line: {}", e, line)))?;

    if let Some(error) = chunk.error {
        return Err(ProviderError::Api(error));
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok((text, chunk.done))
}
