use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::llm::ChatEvent;

/// Longest tool result echoed to the terminal.
pub const TOOL_RESULT_PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Reset,
    History,
    Tools,
    Usage,
    Quit,
    Unknown(String),
}

pub fn print_help() {
    println!(
        "/help     Show help\n/reset    Start a fresh conversation\n/history  Show the history file and message count\n/tools    List tools offered to the model\n/usage    Show tokens reported by the endpoint\n/quit     Quit (also /exit)\nAnything else is sent to the model."
    );
}

/// Lines starting with `/` are commands; everything else is chat input.
pub fn parse_command(line: &str) -> Option<Command> {
    let trimmed = line.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let word = trimmed.split_whitespace().next().unwrap_or(trimmed);
    Some(match word {
        "/help" => Command::Help,
        "/reset" => Command::Reset,
        "/history" => Command::History,
        "/tools" => Command::Tools,
        "/usage" => Command::Usage,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    })
}

pub fn truncate_preview(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptAction {
    CancelTurn,
    Exit,
}

/// Routes Ctrl-C for the whole process.
///
/// The first press during a turn cancels it; a press while idle, or a second
/// press during the same turn, exits.
#[derive(Debug, Clone, Default)]
pub struct Interrupts {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl Interrupts {
    pub fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.slot() = Some(token.clone());
        token
    }

    pub fn end_turn(&self) {
        self.slot().take();
    }

    pub fn interrupt(&self) -> InterruptAction {
        match self.slot().take() {
            Some(token) => {
                token.cancel();
                InterruptAction::CancelTurn
            }
            None => InterruptAction::Exit,
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Answer text goes to stdout; everything else to stderr.
pub fn print_event(event: &ChatEvent) {
    match event {
        ChatEvent::TextDelta(text) => {
            print!("{text}");
            let _ = io::stdout().flush();
        }
        ChatEvent::Thinking(text) => {
            eprint!("{text}");
        }
        ChatEvent::ToolInvoked { name } => {
            eprintln!("\n[tool] {name} ...");
        }
        ChatEvent::ToolCompleted { name, result } => {
            eprintln!(
                "[tool] {name} -> {}",
                truncate_preview(result, TOOL_RESULT_PREVIEW_CHARS)
            );
        }
        ChatEvent::TurnEnded => {
            println!();
        }
    }
}
