// src/infra/errors.rs — Error types for agentdeck

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeckError {
    // Process errors
    #[error("The agent executable `{executable}` is not installed or not on PATH. Install it or set [agent] executable in config.toml.")]
    AgentNotInstalled { executable: String },

    #[error("Failed to start agent process: {message}")]
    Spawn { message: String },

    #[error("Failed to write message to agent process: {message}")]
    StdinWrite { message: String },

    #[error("A response is still being generated for session {session_id}. Wait for it to finish or abort it first.")]
    Busy { session_id: String },

    // Lineage errors
    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("Parent session '{id}' not found")]
    ParentNotFound { id: String },

    // Infra
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeckError {
    /// True when the named session (or parent) is missing from storage.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            DeckError::SessionNotFound { .. } | DeckError::ParentNotFound { .. }
        )
    }
}
