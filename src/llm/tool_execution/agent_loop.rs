use anyhow::{Result, anyhow};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::llm::events::{ChatEvent, EventSender, emit};
use crate::llm::stream::{ChatBackend, StreamDelta};
use crate::llm::stream_tools::ToolDeltaBuffer;
use crate::llm::tool_execution::dispatch::dispatch_round;
use crate::llm::types::{ChatMessage, ChatRequest, ToolCall};
use crate::llm::{LlmErrorKind, classify_error};
use crate::session::{Conversation, HistoryStore, StalenessPolicy};
use crate::tools::ToolRegistry;

pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 16;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub model: String,
    /// Advertise the tool catalog in requests.
    pub enable_tools: bool,
    /// Streaming requests allowed per turn.
    pub max_tool_rounds: usize,
    pub staleness: StalenessPolicy,
}

impl EngineOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            enable_tools: true,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            staleness: StalenessPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { rounds: usize },
    Failed { message: String },
}

#[derive(Debug, Default)]
struct RoundOutput {
    text: String,
    calls: Vec<ToolCall>,
}

/// Drives a turn: stream, dispatch any tool calls, stream again, until the
/// model answers without tools.
pub struct ChatEngine {
    backend: Arc<dyn ChatBackend>,
    registry: Arc<ToolRegistry>,
    store: HistoryStore,
    options: EngineOptions,
}

impl ChatEngine {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        registry: Arc<ToolRegistry>,
        store: HistoryStore,
        options: EngineOptions,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            options,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    /// Runs one turn to completion. `TurnEnded` is emitted exactly once, after
    /// the history has been written, whatever the outcome.
    pub async fn run_turn(
        &self,
        session: &mut Conversation,
        new_messages: Vec<ChatMessage>,
        events: &EventSender,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let now = Utc::now();
        if self
            .options
            .staleness
            .is_stale(session.last_activity(), now)
        {
            info!(last_activity = %session.last_activity(), "conversation idle too long; resetting");
            *session = session.reset();
        }
        session.touch_at(now);
        for message in new_messages {
            session.push(message);
        }

        let outcome = match self.drive(session, events, &cancel).await {
            Ok(rounds) => {
                info!(rounds, "turn completed");
                TurnOutcome::Completed { rounds }
            }
            Err(e) => {
                let message = format!("{e:#}");
                error!(kind = ?classify_error(&e), error = %message, "turn failed");
                emit(Some(events), ChatEvent::TextDelta(format!("Error: {message}")));
                TurnOutcome::Failed { message }
            }
        };

        session.touch_at(Utc::now());
        self.persist(session);
        emit(Some(events), ChatEvent::TurnEnded);
        outcome
    }

    async fn drive(
        &self,
        session: &mut Conversation,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let max_rounds = self.options.max_tool_rounds.max(1);
        let mut round = 0usize;
        loop {
            round += 1;
            debug!(round, messages = session.len(), "starting streaming round");

            let out = self.stream_round(session, events, cancel).await?;
            if out.calls.is_empty() {
                session.push(ChatMessage::assistant(out.text));
                return Ok(round);
            }
            // Calls from the last allowed round are never run; their results
            // could not be sent back.
            if round >= max_rounds {
                warn!(max_rounds, calls = out.calls.len(), "tool round limit reached");
                return Err(anyhow!(LlmErrorKind::MaxRoundsExceeded(max_rounds)));
            }

            info!(round, calls = out.calls.len(), "dispatching tool calls");
            session.push(ChatMessage::assistant_with_tools(
                out.text,
                out.calls.clone(),
            ));
            let results = dispatch_round(&self.registry, &out.calls, Some(events)).await;
            for r in results {
                session.push(ChatMessage::tool_result(r.id, r.result));
            }
            // Durable between rounds, not only at turn end.
            self.persist(session);
        }
    }

    async fn stream_round(
        &self,
        session: &Conversation,
        events: &EventSender,
        cancel: &CancellationToken,
    ) -> Result<RoundOutput> {
        let tools = (self.options.enable_tools && !self.registry.is_empty())
            .then(|| self.registry.definitions());
        let request = ChatRequest {
            model: self.options.model.clone(),
            messages: session.messages().to_vec(),
            temperature: None,
            stream: Some(true),
            tools,
        };

        let mut stream = self.backend.open_stream(request, cancel.clone()).await?;
        let mut out = RoundOutput::default();
        let mut buf = ToolDeltaBuffer::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!("streaming round cancelled");
                    return Err(anyhow!(LlmErrorKind::Cancelled));
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamDelta::Text(text))) => {
                    out.text.push_str(&text);
                    emit(Some(events), ChatEvent::TextDelta(text));
                }
                Some(Ok(StreamDelta::Thinking(text))) => {
                    emit(Some(events), ChatEvent::Thinking(text));
                }
                Some(Ok(StreamDelta::ToolCalls(deltas))) => {
                    for d in &deltas {
                        buf.push(d);
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }

        out.calls = buf.finish();
        Ok(out)
    }

    fn persist(&self, session: &Conversation) {
        if let Err(e) = self.store.save(session.messages()) {
            warn!(error = %e, path = %self.store.path().display(), "failed to persist history");
        }
    }
}
