//! Conversational backend contract and an OpenAI-compatible streaming client.
//!
//! The default endpoint is Zhipu's GLM API, which speaks the OpenAI
//! `chat/completions` protocol: a JSON request with `stream: true` answered by
//! server-sent events whose `data:` lines carry text deltas, terminated by
//! `data: [DONE]`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use shared_types::ContextMessage;

use crate::config::ChatConfig;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("Chat backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Chat stream abandoned")]
    StreamAbandoned,
}

/// Ordered text deltas of one reply.
pub type ChatStream = BoxStream<'static, Result<String, ChatError>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a streamed completion for `messages` (oldest first, the user's
    /// new message last).
    async fn stream_chat(&self, messages: Vec<ContextMessage>) -> Result<ChatStream, ChatError>;

    fn model(&self) -> &str;
}

// ============================================================================
// OpenAI-compatible HTTP backend
// ============================================================================

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamErrorBody {
    #[serde(default)]
    message: String,
}

pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    config: ChatConfig,
}

impl OpenAiCompatibleBackend {
    pub fn new(config: ChatConfig) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChatError::BackendUnavailable(format!("HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatBackend for OpenAiCompatibleBackend {
    async fn stream_chat(&self, messages: Vec<ContextMessage>) -> Result<ChatStream, ChatError> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            ChatError::BackendUnavailable(
                "no API key configured (set COCKPIT_AI_API_KEY or ZHIPUAI_API_KEY)".to_string(),
            )
        })?;

        let request = CompletionRequest {
            model: &self.config.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            stream: true,
        };

        let endpoint = self.endpoint();
        tracing::debug!(
            endpoint = %endpoint,
            model = %self.config.model,
            messages = messages.len(),
            "Starting chat completion stream"
        );

        let send = self
            .client
            .post(&endpoint)
            .bearer_auth(api_key)
            .json(&request)
            .send();
        let response = tokio::time::timeout(self.config.connect_timeout, send)
            .await
            .map_err(|_| {
                ChatError::BackendUnavailable(format!(
                    "no response from {endpoint} within {}s",
                    self.config.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| ChatError::BackendUnavailable(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::BackendUnavailable(format!(
                "status {status}: {}",
                body.trim()
            )));
        }

        Ok(delta_stream(
            Box::pin(response.bytes_stream()),
            self.config.idle_timeout,
        ))
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

// ============================================================================
// SSE parsing
// ============================================================================

#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Delta(String),
    Done,
    Failed(String),
    Skip,
}

fn parse_sse_line(line: &[u8]) -> SseLine {
    let line = String::from_utf8_lossy(line);
    let Some(data) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                return SseLine::Failed(error.message);
            }
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .filter(|content| !content.is_empty())
                .map(SseLine::Delta)
                .unwrap_or(SseLine::Skip)
        }
        Err(e) => {
            tracing::debug!(error = %e, "Skipping unparseable stream line");
            SseLine::Skip
        }
    }
}

struct SseState<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ChatError>>,
    finished: bool,
    idle_timeout: Duration,
}

impl<S> SseState<S> {
    /// Parse every complete line in the buffer, stopping at the end marker.
    fn drain_lines(&mut self) {
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if self.take_line(&line) {
                return;
            }
        }
    }

    /// Returns true when `line` ended the stream.
    fn take_line(&mut self, line: &[u8]) -> bool {
        match parse_sse_line(line) {
            SseLine::Delta(text) => {
                self.pending.push_back(Ok(text));
                false
            }
            SseLine::Done => {
                self.finished = true;
                true
            }
            SseLine::Failed(message) => {
                self.pending.push_back(Err(ChatError::BackendUnavailable(message)));
                self.finished = true;
                true
            }
            SseLine::Skip => false,
        }
    }
}

/// Turn a raw SSE byte stream into text deltas. A silence longer than
/// `idle_timeout`, or a body that ends before `data: [DONE]`, ends the stream
/// with `BackendUnavailable`.
pub(crate) fn delta_stream<S, E>(body: S, idle_timeout: Duration) -> ChatStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = SseState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        idle_timeout,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match tokio::time::timeout(state.idle_timeout, state.body.next()).await {
                Err(_) => {
                    state.finished = true;
                    state.pending.push_back(Err(ChatError::BackendUnavailable(format!(
                        "stream stalled for {}s",
                        state.idle_timeout.as_secs()
                    ))));
                }
                Ok(None) => {
                    let rest = std::mem::take(&mut state.buffer);
                    let ended = !rest.is_empty() && state.take_line(&rest);
                    state.finished = true;
                    if !ended {
                        state.pending.push_back(Err(ChatError::BackendUnavailable(
                            "stream ended before [DONE]".to_string(),
                        )));
                    }
                }
                Ok(Some(Err(e))) => {
                    state.finished = true;
                    state.pending.push_back(Err(ChatError::BackendUnavailable(format!(
                        "stream read failed: {e}"
                    ))));
                }
                Ok(Some(Ok(chunk))) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines();
                }
            }
        }
    })
    .boxed()
}
