use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

pub const LOG_ENV: &str = "TOOLCHAT_LOG";

/// Directive from `--log-level`, then `TOOLCHAT_LOG`, then `info`.
pub fn resolve_filter(cli_level: Option<&str>) -> String {
    let non_blank = |s: &String| !s.trim().is_empty();
    cli_level
        .map(str::to_string)
        .filter(non_blank)
        .or_else(|| std::env::var(LOG_ENV).ok().filter(non_blank))
        .unwrap_or_else(|| "info".to_string())
}

pub fn init_logging(level: Option<&str>, file: &Path) -> Result<()> {
    let log_file = std::sync::Arc::new(
        std::fs::File::create(file)
            .with_context(|| format!("create log file: {}", file.display()))?,
    );
    let filter = resolve_filter(level);
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(log_file)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    info!(filter = %filter, "logging initialized");
    Ok(())
}
