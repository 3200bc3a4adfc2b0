//! Error types for vigil-core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the vigil-core library
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transcript root missing or unreadable at monitor start
    #[error("transcript root unavailable: {root}")]
    TranscriptUnavailable { root: PathBuf },

    /// No transcript matched the invocation within the correlation window
    #[error("no transcript appeared for {project} within {waited_secs}s")]
    CorrelationTimeout { project: PathBuf, waited_secs: u64 },

    /// Session store write failure; fatal to the affected session only
    #[error("store write failed at {path}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl Error {
    /// True for failures that degrade monitoring without failing the agent run.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            Error::TranscriptUnavailable { .. } | Error::CorrelationTimeout { .. }
        )
    }
}

/// Result type alias for vigil-core
pub type Result<T> = std::result::Result<T, Error>;
