use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("History file not found: {0}")]
    NotFound(String),
    #[error("Failed to read history: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to parse history: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Failed to create history directory: {0}")]
    CreateDirError(std::io::Error),
    #[error("Failed to write history: {0}")]
    WriteError(std::io::Error),
}
