use chrono::{DateTime, Local};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error};

use crate::llm::types::ChatMessage;
use crate::session::error::SessionError;

/// Writes the conversation to one JSON file per process run.
///
/// The file name is fixed at construction; every save overwrites it.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pub(crate) dir: PathBuf,
    file_name: String,
}

impl HistoryStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &str) -> Self {
        Self::with_timestamp(dir, prefix, Local::now())
    }

    pub fn with_timestamp(dir: impl Into<PathBuf>, prefix: &str, at: DateTime<Local>) -> Self {
        Self {
            dir: dir.into(),
            file_name: format!("{prefix}_{}.json", at.format("%Y%m%d_%H%M%S")),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Overwrites the history file with the pretty-printed message array.
    pub fn save(&self, messages: &[ChatMessage]) -> Result<PathBuf, SessionError> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            error!(?e, "Failed to create history directory: {:?}", self.dir);
            SessionError::CreateDirError(e)
        })?;
        let path = self.path();
        let json_data = serde_json::to_string_pretty(messages)?;
        fs::write(&path, json_data).map_err(|e| {
            error!(?e, "Failed to write history file: {:?}", path);
            SessionError::WriteError(e)
        })?;
        debug!(path = %path.display(), messages = messages.len(), "history saved");
        Ok(path)
    }

    pub fn load(&self) -> Result<Vec<ChatMessage>, SessionError> {
        let path = self.path();
        if !path.exists() {
            return Err(SessionError::NotFound(path.display().to_string()));
        }
        let s = fs::read_to_string(&path).map_err(SessionError::ReadError)?;
        Ok(serde_json::from_str(&s)?)
    }
}
