use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::llm::types::{ChatMessage, Role};

/// When a conversation counts as stale at the start of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessPolicy {
    Never,
    IdleTimeout(Duration),
}

impl StalenessPolicy {
    pub fn idle_secs(secs: u64) -> Self {
        if secs == 0 {
            StalenessPolicy::Never
        } else {
            StalenessPolicy::IdleTimeout(Duration::seconds(secs.min(u32::MAX as u64) as i64))
        }
    }

    pub fn is_stale(&self, last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            StalenessPolicy::Never => false,
            StalenessPolicy::IdleTimeout(limit) => now - last_activity > *limit,
        }
    }
}

/// Ordered message history of one conversation.
///
/// Always starts with exactly one system message and is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    system_prompt: String,
    messages: Vec<ChatMessage>,
    last_activity: DateTime<Utc>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        let system_prompt = system_prompt.into();
        Self {
            messages: vec![ChatMessage::system(system_prompt.clone())],
            system_prompt,
            last_activity: Utc::now(),
        }
    }

    /// A fresh conversation with the same system prompt.
    pub fn reset(&self) -> Self {
        Self::new(self.system_prompt.clone())
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn push(&mut self, message: ChatMessage) {
        if message.role == Role::System {
            warn!("ignoring extra system message; conversation keeps a single system prompt");
            return;
        }
        self.messages.push(message);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn touch_at(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }
}
