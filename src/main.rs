mod cli;
mod config;
mod llm;
mod logging;
mod session;
mod tools;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Command, InterruptAction, Interrupts, parse_command, print_event, print_help};
use crate::config::{AppConfig, Cli};
use crate::llm::{
    ChatEngine, ChatEvent, ChatMessage, EngineOptions, OpenAIClient, TurnOutcome, event_channel,
};
use crate::session::{Conversation, HistoryStore, StalenessPolicy};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    logging::init_logging(cli.log_level.as_deref(), &cli.log_file)?;

    let cfg = AppConfig::from_cli(&cli)?;
    info!(
        base_url = %cfg.base_url,
        model = %cfg.model,
        enable_tools = cfg.enable_tools,
        history_dir = %cfg.history_dir.display(),
        "app config"
    );

    run_repl(cfg).await
}

async fn run_repl(cfg: AppConfig) -> Result<()> {
    let api_key = match cfg.api_key.clone() {
        Some(key) => key,
        None => {
            warn!("no API key configured");
            eprintln!("OPENAI_API_KEY not set; requests will likely be rejected.");
            String::new()
        }
    };
    let client =
        OpenAIClient::new(cfg.base_url.clone(), api_key)?.with_llm_config(cfg.llm.clone())?;
    let registry = Arc::new(tools::default_registry(&cfg.project_root)?);
    let store = HistoryStore::new(cfg.history_dir.clone(), &cfg.history_prefix);
    let options = EngineOptions {
        enable_tools: cfg.enable_tools,
        max_tool_rounds: cfg.max_tool_rounds,
        staleness: StalenessPolicy::idle_secs(cfg.session_idle_timeout_secs),
        ..EngineOptions::new(cfg.model.clone())
    };
    let engine = ChatEngine::new(Arc::new(client.clone()), registry, store, options);
    let mut session = Conversation::new(cfg.system_prompt.clone());

    let interrupts = Interrupts::default();
    let exit = CancellationToken::new();
    spawn_interrupt_listener(interrupts.clone(), exit.clone());

    println!("toolchat ({}) - type /help for commands", cfg.model);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = exit.cancelled() => break,
            line = lines.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        if let Some(cmd) = parse_command(&line) {
            match cmd {
                Command::Help => print_help(),
                Command::Reset => {
                    session = session.reset();
                    println!("conversation reset");
                }
                Command::History => {
                    let path = engine.store().path();
                    match engine.store().load() {
                        Ok(saved) => println!(
                            "{} ({} messages in memory, {} saved)",
                            path.display(),
                            session.len(),
                            saved.len()
                        ),
                        Err(e) => println!(
                            "{} ({} messages in memory; {e})",
                            path.display(),
                            session.len()
                        ),
                    }
                }
                Command::Tools => {
                    if !engine.options().enable_tools {
                        println!("tools are disabled");
                    }
                    for def in engine.registry().definitions() {
                        println!("{}  {}", def.function.name, def.function.description);
                    }
                }
                Command::Usage => {
                    println!(
                        "tokens: {} total, {} prompt",
                        client.get_tokens_used(),
                        client.get_prompt_tokens_used()
                    );
                }
                Command::Quit => break,
                Command::Unknown(name) => eprintln!("unknown command {name}; try /help"),
            }
            continue;
        }

        let (tx, mut rx) = event_channel();
        let printer = tokio::spawn(async move {
            while let Some(ev) = rx.recv().await {
                print_event(&ev);
                if ev == ChatEvent::TurnEnded {
                    break;
                }
            }
        });

        let cancel = interrupts.begin_turn();
        let outcome = tokio::select! {
            outcome = engine.run_turn(&mut session, vec![ChatMessage::user(line)], &tx, cancel) => Some(outcome),
            _ = exit.cancelled() => None,
        };
        interrupts.end_turn();
        drop(tx);
        let _ = printer.await;

        match outcome {
            Some(TurnOutcome::Failed { message }) => warn!(%message, "turn failed"),
            Some(TurnOutcome::Completed { .. }) => {}
            None => {
                warn!("exit requested during a turn");
                break;
            }
        }
    }

    if exit.is_cancelled() {
        // Runtime shutdown waits on the blocking stdin reader.
        info!("interrupted; exiting");
        std::process::exit(130);
    }
    info!("bye");
    Ok(())
}

/// One SIGINT handler for the process lifetime.
fn spawn_interrupt_listener(interrupts: Interrupts, exit: CancellationToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match interrupts.interrupt() {
                InterruptAction::CancelTurn => {
                    eprintln!("\n[interrupted; press Ctrl-C again to quit]");
                }
                InterruptAction::Exit => {
                    exit.cancel();
                    break;
                }
            }
        }
    });
}
