//! Error types for Tether Core
//!
//! Session and compaction failures. Everything here is returned synchronously
//! to the caller except [`CoreError::SummarizerFailure`], which the pruner
//! absorbs and converts into a fallback.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

/// Main error type for session and compaction operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Reference to a session id that does not exist
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// Mutation attempted on a closed session
    #[error("Session is closed: {0}")]
    SessionClosed(String),

    /// Message rejected before it reached the log
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Summarizer collaborator failed or timed out. Never leaves the pruner.
    #[error("Summarizer failure: {0}")]
    SummarizerFailure(String),
}

impl CoreError {
    /// Whether this error is internal to compaction and must not reach callers
    pub fn is_internal(&self) -> bool {
        matches!(self, CoreError::SummarizerFailure(_))
    }
}
