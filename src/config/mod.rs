use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::llm::DEFAULT_MAX_TOOL_ROUNDS;

pub const PROJECT_DIR: &str = ".toolchat";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_HISTORY_PREFIX: &str = "chat";
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help answer the question, and answer concisely.";

/// Command-line overrides; every field left unset falls through to the
/// environment and config files.
#[derive(Debug, Clone, Default, clap::Parser)]
#[command(name = "toolchat", version, about = "Streaming chat with tool calling")]
pub struct Cli {
    #[arg(long)]
    pub base_url: Option<String>,
    #[arg(long)]
    pub model: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
    /// Do not advertise tools to the model
    #[arg(long)]
    pub no_tools: bool,
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(long)]
    pub history_dir: Option<PathBuf>,
    #[arg(long)]
    pub history_prefix: Option<String>,
    #[arg(long)]
    pub max_tool_rounds: Option<usize>,
    /// Reset the conversation after this many idle seconds (0 disables)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,
    #[arg(long)]
    pub log_level: Option<String>,
    #[arg(long, default_value = "./debug.log")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub enable_tools: bool,
    pub system_prompt: String,
    pub history_dir: PathBuf,
    pub history_prefix: String,
    pub max_tool_rounds: usize,
    pub session_idle_timeout_secs: u64,
    pub project_root: PathBuf,
    pub llm: LlmConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            enable_tools: true,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_dir: project_root.join(PROJECT_DIR).join("history"),
            history_prefix: DEFAULT_HISTORY_PREFIX.to_string(),
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            session_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            project_root,
            llm: LlmConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    pub connect_timeout_ms: u64,
    /// Longest gap allowed between two reads of the response body.
    pub read_idle_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            read_idle_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FileConfig {
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub enable_tools: Option<bool>,
    pub system_prompt: Option<String>,
    pub history_dir: Option<PathBuf>,
    pub history_prefix: Option<String>,
    pub max_tool_rounds: Option<usize>,
    pub session_idle_timeout_secs: Option<u64>,
    pub project_root: Option<PathBuf>,
    pub llm: Option<PartialLlmConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct PartialLlmConfig {
    pub connect_timeout_ms: Option<u64>,
    pub read_idle_timeout_ms: Option<u64>,
}

impl PartialLlmConfig {
    fn or(self, other: PartialLlmConfig) -> PartialLlmConfig {
        PartialLlmConfig {
            connect_timeout_ms: self.connect_timeout_ms.or(other.connect_timeout_ms),
            read_idle_timeout_ms: self.read_idle_timeout_ms.or(other.read_idle_timeout_ms),
        }
    }
}

/// Values read from the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub enable_tools: Option<bool>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        Self {
            api_key: non_empty_var("OPENAI_API_KEY"),
            base_url: non_empty_var("OPENAI_BASE_URL"),
            model: non_empty_var("OPENAI_MODEL"),
            enable_tools: non_empty_var("TOOLCHAT_ENABLE_TOOLS").and_then(|v| parse_bool(&v)),
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl AppConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let cwd = std::env::current_dir().context("resolve current dir")?;
        let project_cfg = load_project_config(&cwd).unwrap_or_default();
        let file_cfg = load_file_config().unwrap_or_default();
        Ok(Self::resolve(
            cli,
            &EnvOverrides::from_env(),
            project_cfg,
            file_cfg,
            cwd,
        ))
    }

    /// Merges the layers: CLI, then environment, then project file, then
    /// global file, then defaults.
    pub fn resolve(
        cli: &Cli,
        env: &EnvOverrides,
        project_cfg: FileConfig,
        file_cfg: FileConfig,
        cwd: PathBuf,
    ) -> Self {
        let project_root = project_cfg
            .project_root
            .clone()
            .or(file_cfg.project_root.clone())
            .unwrap_or(cwd);

        let api_key = cli
            .api_key
            .clone()
            .or_else(|| env.api_key.clone())
            .or(project_cfg.api_key)
            .or(file_cfg.api_key);
        let base_url = cli
            .base_url
            .clone()
            .or_else(|| env.base_url.clone())
            .or(project_cfg.base_url)
            .or(file_cfg.base_url)
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let model = cli
            .model
            .clone()
            .or_else(|| env.model.clone())
            .or(project_cfg.model)
            .or(file_cfg.model)
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let enable_tools = if cli.no_tools {
            false
        } else {
            env.enable_tools
                .or(project_cfg.enable_tools)
                .or(file_cfg.enable_tools)
                .unwrap_or(true)
        };
        let system_prompt = cli
            .system_prompt
            .clone()
            .or(project_cfg.system_prompt)
            .or(file_cfg.system_prompt)
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        // Relative history dirs are anchored at the project root.
        let history_dir = cli
            .history_dir
            .clone()
            .or(project_cfg.history_dir)
            .or(file_cfg.history_dir)
            .map(|d| {
                if d.is_absolute() {
                    d
                } else {
                    project_root.join(d)
                }
            })
            .unwrap_or_else(|| project_root.join(PROJECT_DIR).join("history"));
        let history_prefix = cli
            .history_prefix
            .clone()
            .or(project_cfg.history_prefix)
            .or(file_cfg.history_prefix)
            .unwrap_or_else(|| DEFAULT_HISTORY_PREFIX.to_string());
        let max_tool_rounds = cli
            .max_tool_rounds
            .or(project_cfg.max_tool_rounds)
            .or(file_cfg.max_tool_rounds)
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
            .max(1);
        let session_idle_timeout_secs = cli
            .idle_timeout_secs
            .or(project_cfg.session_idle_timeout_secs)
            .or(file_cfg.session_idle_timeout_secs)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);

        let llm_defaults = LlmConfig::default();
        let llm = {
            let merged = project_cfg
                .llm
                .unwrap_or_default()
                .or(file_cfg.llm.unwrap_or_default());
            LlmConfig {
                connect_timeout_ms: merged
                    .connect_timeout_ms
                    .unwrap_or(llm_defaults.connect_timeout_ms),
                read_idle_timeout_ms: merged
                    .read_idle_timeout_ms
                    .unwrap_or(llm_defaults.read_idle_timeout_ms),
            }
        };

        Self {
            base_url,
            model,
            api_key,
            enable_tools,
            system_prompt,
            history_dir,
            history_prefix,
            max_tool_rounds,
            session_idle_timeout_secs,
            project_root,
            llm,
        }
    }
}

fn candidate_paths() -> Vec<PathBuf> {
    let mut v = Vec::new();
    if let Ok(p) = std::env::var("TOOLCHAT_CONFIG") {
        v.push(PathBuf::from(p));
    }
    if let Ok(xdg_home) = std::env::var("XDG_CONFIG_HOME") {
        v.push(Path::new(&xdg_home).join("toolchat/config.toml"));
    } else if let Some(config_dir) = dirs::config_dir() {
        v.push(config_dir.join("toolchat/config.toml"));
    }
    if let Ok(dirs) = std::env::var("XDG_CONFIG_DIRS") {
        for d in dirs.split(':') {
            if !d.is_empty() {
                v.push(Path::new(d).join("toolchat/config.toml"));
            }
        }
    }
    v
}

/// First readable and parseable global config file, or defaults.
pub fn load_file_config() -> Result<FileConfig> {
    for p in candidate_paths() {
        if p.exists() {
            let s = fs::read_to_string(&p)
                .with_context(|| format!("read config file: {}", p.display()))?;
            match toml::from_str::<FileConfig>(&s) {
                Ok(cfg) => {
                    info!(path=%p.display(), "loaded config file");
                    return Ok(cfg);
                }
                Err(e) => {
                    warn!(path=%p.display(), error=%e.to_string(), "parse config failed");
                    continue;
                }
            }
        }
    }
    Ok(FileConfig::default())
}

/// Load project-specific configuration from .toolchat/config.toml
pub fn load_project_config(project_root: &Path) -> Result<FileConfig> {
    let project_config_path = project_root.join(PROJECT_DIR).join("config.toml");

    if project_config_path.exists() {
        let s = fs::read_to_string(&project_config_path).with_context(|| {
            format!(
                "read project config file: {}",
                project_config_path.display()
            )
        })?;
        match toml::from_str::<FileConfig>(&s) {
            Ok(cfg) => {
                info!(path=%project_config_path.display(), "loaded project config file");
                Ok(cfg)
            }
            Err(e) => {
                warn!(path=%project_config_path.display(), error=%e.to_string(), "parse project config failed");
                Ok(FileConfig::default())
            }
        }
    } else {
        Ok(FileConfig::default())
    }
}
