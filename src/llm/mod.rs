mod client_core;
mod events;
mod stream;
mod stream_tools;
mod tool_execution;
pub mod types;

use reqwest::StatusCode;
use thiserror::Error;

pub use client_core::*;
pub use events::*;
pub use tool_execution::*;
pub use types::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmErrorKind {
    #[error("rate limited")]
    RateLimited,
    #[error("server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("request rejected")]
    Client,
    #[error("malformed response")]
    Deserialize,
    #[error("request cancelled")]
    Cancelled,
    #[error("maximum tool rounds ({0}) exceeded")]
    MaxRoundsExceeded(usize),
    #[error("unknown error")]
    Unknown,
}

impl LlmErrorKind {
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            LlmErrorKind::RateLimited
        } else if status == StatusCode::REQUEST_TIMEOUT {
            LlmErrorKind::Timeout
        } else if status.is_server_error() {
            LlmErrorKind::Server
        } else if status.is_client_error() {
            LlmErrorKind::Client
        } else {
            LlmErrorKind::Unknown
        }
    }
}

pub fn classify_error(err: &anyhow::Error) -> LlmErrorKind {
    if let Some(kind) = err.downcast_ref::<LlmErrorKind>() {
        return kind.clone();
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if let Some(st) = e.status() {
            return LlmErrorKind::from_status(st);
        }
        if e.is_connect() || e.is_body() || e.is_request() || e.is_decode() {
            return LlmErrorKind::Network;
        }
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return LlmErrorKind::Deserialize;
    }
    LlmErrorKind::Unknown
}
