use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone)]
pub struct OpenAIClient {
    pub base_url: String,
    pub api_key: String,
    pub(crate) inner: reqwest::Client,
    pub llm_cfg: LlmConfig,
    /// Tracks total tokens reported by the endpoint
    pub tokens_used: Arc<AtomicU32>,
    /// Tracks prompt tokens reported by the endpoint
    pub prompt_tokens_used: Arc<AtomicU32>,
}

impl OpenAIClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let inner = reqwest::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            inner,
            llm_cfg: LlmConfig::default(),
            tokens_used: Arc::new(AtomicU32::new(0)),
            prompt_tokens_used: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn with_llm_config(mut self, cfg: LlmConfig) -> Result<Self> {
        // Connect and idle-read timeouts only; a stream has no total deadline.
        self.inner = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .read_timeout(Duration::from_millis(cfg.read_idle_timeout_ms))
            .build()?;
        self.llm_cfg = cfg;
        Ok(self)
    }

    /// `/v1` is added only when the base has no version segment of its own;
    /// any other path (e.g. `/v1beta/openai`) is used as given.
    pub(crate) fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let has_path = base
            .split_once("://")
            .map_or(base, |(_, rest)| rest)
            .contains('/');
        if base.ends_with("/v1") || has_path {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    pub fn get_tokens_used(&self) -> u32 {
        self.tokens_used.load(Ordering::Relaxed)
    }

    pub fn get_prompt_tokens_used(&self) -> u32 {
        self.prompt_tokens_used.load(Ordering::Relaxed)
    }
}
