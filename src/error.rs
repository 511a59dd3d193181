//! Error types for the langd engine

use thiserror::Error;

/// Main error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    /// Terminal: the session has been shut down. Every mutation attempted
    /// after this point fails immediately; pending completion signals are
    /// opened without running diagnosis.
    #[error("server is shut down")]
    ShutDown,

    /// Malformed client input, e.g. an inverted or missing edit range.
    /// Rejected per-request; never corrupts a snapshot.
    #[error("invalid edit: {message}")]
    InvalidEdit { message: String },

    /// No view's scope contains the given URI. The caller may react by
    /// registering a new workspace folder.
    #[error("no view found for {uri}")]
    NoViewFound { uri: String },

    /// A URI that does not round-trip to a filesystem path.
    #[error("invalid file URI: {uri}")]
    InvalidUri { uri: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid_edit(message: impl Into<String>) -> Self {
        Self::InvalidEdit {
            message: message.into(),
        }
    }

    /// True if the error is the terminal shut-down error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
