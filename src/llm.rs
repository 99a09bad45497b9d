//! OpenAI-compatible chat backend client.
//!
//! Works against api.openai.com or any compatible endpoint (Ollama, LocalAI,
//! vLLM) via a configurable base URL. Streaming responses are consumed as
//! server-sent events and forwarded over a channel as plain text deltas, so
//! the resolver can republish a growing snapshot per increment.

use crate::config::LlmConfig;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("backend returned no content")]
    Empty,
}

/// One role-tagged turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Client for the chat-completion backend.
pub struct LlmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    system_prompt: Option<String>,
}

impl LlmClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
            system_prompt: cfg.system_prompt.clone(),
        })
    }

    fn request(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self.http.post(url).header("content-type", "application/json");
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    fn messages(&self, history: &[ChatTurn]) -> Vec<ChatTurn> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatTurn {
                role: Role::System,
                content: prompt.clone(),
            });
        }
        messages.extend_from_slice(history);
        messages
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        Err(LlmError::Api { status, message })
    }

    /// Single-shot completion of the conversation.
    pub async fn chat(&self, model: &str, history: &[ChatTurn]) -> Result<String, LlmError> {
        let body = ChatCompletionRequest {
            model,
            messages: self.messages(history),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };
        let response = self
            .request(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?;
        let parsed: ChatCompletionResponse = Self::check_status(response).await?.json().await?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.and_then(|m| m.content))
            .ok_or(LlmError::Empty)
    }

    /// Stream a completion; the receiver yields text deltas in generation
    /// order and closes when the backend signals `[DONE]`. A mid-stream
    /// failure is delivered as a final `Err` item.
    pub async fn chat_stream(
        &self,
        model: &str,
        history: &[ChatTurn],
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let body = ChatCompletionRequest {
            model,
            messages: self.messages(history),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
        };
        let response = self
            .request(format!("{}/chat/completions", self.base_url))
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            'outer: while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(LlmError::Http(e))).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim_end_matches('\r').to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        break 'outer;
                    }
                    if let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) {
                        let delta = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.and_then(|d| d.content));
                        if let Some(text) = delta {
                            if !text.is_empty() && tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// List model identifiers offered by the backend.
    pub async fn list_models(&self) -> Result<Vec<String>, LlmError> {
        let mut builder = self.http.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {key}"));
        }
        let response = Self::check_status(builder.send().await?).await?;
        let parsed: ModelsResponse = response.json().await?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatTurn>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ResponseMessage>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}
