use tokio::sync::mpsc;

/// Incremental output of one turn, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    TextDelta(String),
    Thinking(String),
    ToolInvoked { name: String },
    ToolCompleted { name: String, result: String },
    /// Sent exactly once per turn, after the history has been written.
    TurnEnded,
}

pub type EventSender = mpsc::UnboundedSender<ChatEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ChatEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// A dropped receiver must never fail a turn.
pub(crate) fn emit(events: Option<&EventSender>, event: ChatEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
