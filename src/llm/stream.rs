use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::llm::LlmErrorKind;
use crate::llm::client_core::OpenAIClient;
use crate::llm::types::{ChatRequest, Usage};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamChoiceDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    // Reasoning text from providers that expose it (DeepSeek, OpenRouter, vLLM)
    #[serde(default)]
    pub reasoning_content: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    // OpenAI-compatible tool_calls (streamed as incremental deltas)
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>, // "function"
    #[serde(default)]
    pub function: Option<ToolCallFunctionDelta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ToolCallFunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>, // streamed as partial JSON string
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub delta: StreamChoiceDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// One demultiplexed piece of a streamed completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamDelta {
    Text(String),
    Thinking(String),
    ToolCalls(Vec<ToolCallDelta>),
}

impl ChatStreamChunk {
    pub fn into_deltas(self) -> Vec<StreamDelta> {
        let mut out = Vec::new();
        for ch in self.choices {
            let delta = ch.delta;
            if let Some(thinking) = delta.reasoning_content.or(delta.reasoning)
                && !thinking.is_empty()
            {
                out.push(StreamDelta::Thinking(thinking));
            }
            if let Some(text) = delta.content
                && !text.is_empty()
            {
                out.push(StreamDelta::Text(text));
            }
            if let Some(calls) = delta.tool_calls
                && !calls.is_empty()
            {
                out.push(StreamDelta::ToolCalls(calls));
            }
        }
        out
    }
}

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<StreamDelta>> + Send>>;

/// A completion endpoint that answers a request with a finite stream of deltas.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn open_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream>;
}

/// Splits an SSE byte stream into `data:` payloads.
#[derive(Debug, Default)]
pub(crate) struct SseLineBuffer {
    buf: Vec<u8>,
    done: bool,
}

impl SseLineBuffer {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut start = 0usize;
        for i in 0..self.buf.len() {
            if self.buf[i] == b'\n' {
                let line = String::from_utf8_lossy(&self.buf[start..i]).into_owned();
                start = i + 1;
                self.accept_line(&line, &mut out);
            }
        }
        if start > 0 {
            self.buf.drain(0..start);
        }
        out
    }

    /// Flushes a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            self.accept_line(&line, &mut out);
        }
        out
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn accept_line(&mut self, line: &str, out: &mut Vec<String>) {
        if self.done {
            return;
        }
        let s = line.trim();
        if s.is_empty() || s.starts_with(':') {
            return;
        }
        let payload = if let Some(rest) = s.strip_prefix("data:") {
            rest.trim()
        } else if s.starts_with('{') {
            // JSON-lines style endpoints
            s
        } else {
            // event:, id:, retry:
            return;
        };
        if payload == "[DONE]" {
            self.done = true;
            return;
        }
        out.push(payload.to_string());
    }
}

pub(crate) fn parse_chunk(payload: &str) -> Result<ChatStreamChunk> {
    let chunk: ChatStreamChunk = serde_json::from_str(payload)
        .with_context(|| format!("malformed stream chunk: {payload}"))?;
    if let Some(err) = &chunk.error {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(anyhow!(LlmErrorKind::Server).context(format!("stream error: {message}")));
    }
    Ok(chunk)
}

fn record_usage(total: &AtomicU32, prompt: &AtomicU32, usage: &Usage) {
    total.fetch_add(usage.total_tokens, Ordering::Relaxed);
    prompt.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
}

impl OpenAIClient {
    pub async fn chat_stream(
        &self,
        req: &ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let url = self.endpoint();

        if let Ok(payload) = serde_json::to_string_pretty(req) {
            debug!(payload=%payload, endpoint=%url, "sending chat.completions payload (stream)");
        }

        let fut = self
            .inner
            .post(url.clone())
            .bearer_auth(&self.api_key)
            .json(req)
            .send();

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("chat_stream cancelled before response");
                return Err(anyhow!(LlmErrorKind::Cancelled));
            }
            res = fut => res.context("send chat request (stream)")?,
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            error!(status=%status.as_u16(), body=%text, "llm chat_stream non-success status");
            return Err(anyhow!(LlmErrorKind::from_status(status))
                .context(format!("chat error: {status} - {text}")));
        }

        let mut byte_stream = resp.bytes_stream();
        let tokens_used = Arc::clone(&self.tokens_used);
        let prompt_tokens_used = Arc::clone(&self.prompt_tokens_used);

        let stream = async_stream::try_stream! {
            let mut lines = SseLineBuffer::default();
            let mut eof = false;
            while !eof {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!("chat_stream cancelled during byte stream read");
                        Err(anyhow!(LlmErrorKind::Cancelled))
                    }
                    chunk = byte_stream.next() => match chunk {
                        Some(Ok(bytes)) => Ok(Some(bytes)),
                        Some(Err(e)) => Err(anyhow::Error::new(e).context("byte stream read error")),
                        None => Ok(None),
                    }
                };

                let payloads = match next? {
                    Some(bytes) => lines.push(&bytes),
                    None => {
                        eof = true;
                        lines.finish()
                    }
                };

                for payload in payloads {
                    debug!(response_chunk=%payload, "llm chat_stream response");
                    let chunk = parse_chunk(&payload)?;
                    if let Some(usage) = &chunk.usage {
                        record_usage(&tokens_used, &prompt_tokens_used, usage);
                    }
                    for delta in chunk.into_deltas() {
                        yield delta;
                    }
                }

                if lines.is_done() {
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl ChatBackend for OpenAIClient {
    async fn open_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        self.chat_stream(&request, cancel).await
    }
}
