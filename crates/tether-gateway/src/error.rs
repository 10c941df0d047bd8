//! Error types for the Gateway

use serde::{Deserialize, Serialize};
use tether_core::CoreError;
use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Session is closed: {0}")]
    SessionClosed(String),

    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("No eligible target for {0}")]
    NoEligibleTarget(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Command {id} timed out after {attempts} attempts")]
    CommandTimedOut { id: String, attempts: u32 },

    #[error("Command not confirmed: {0}")]
    NotConfirmed(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Closed set of error kinds carried by `error` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidDescriptor,
    UnknownNode,
    UnknownSession,
    SessionClosed,
    LinkUnavailable,
    NoEligibleTarget,
    NodeUnavailable,
    CommandTimedOut,
    NotConfirmed,
    UnknownCommand,
    CommandFailed,
    InvalidFrame,
    Internal,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            GatewayError::UnknownNode(_) => ErrorKind::UnknownNode,
            GatewayError::UnknownSession(_) => ErrorKind::UnknownSession,
            GatewayError::SessionClosed(_) => ErrorKind::SessionClosed,
            GatewayError::LinkUnavailable(_) => ErrorKind::LinkUnavailable,
            GatewayError::NoEligibleTarget(_) => ErrorKind::NoEligibleTarget,
            GatewayError::NodeUnavailable(_) => ErrorKind::NodeUnavailable,
            GatewayError::CommandTimedOut { .. } => ErrorKind::CommandTimedOut,
            GatewayError::NotConfirmed(_) => ErrorKind::NotConfirmed,
            GatewayError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            GatewayError::CommandFailed(_) => ErrorKind::CommandFailed,
            GatewayError::InvalidFrame(_) | GatewayError::Serialization(_) => ErrorKind::InvalidFrame,
            GatewayError::WebSocket(_)
            | GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Structured body for an outbound `error` frame
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        })
    }
}

impl From<CoreError> for GatewayError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::UnknownSession(id) => GatewayError::UnknownSession(id),
            CoreError::SessionClosed(id) => GatewayError::SessionClosed(id),
            CoreError::InvalidMessage(msg) => GatewayError::InvalidFrame(msg),
            // absorbed by the pruner, only reachable through a bug
            CoreError::SummarizerFailure(msg) => GatewayError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::Serialization(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocket(e.to_string())
    }
}

/// Result type for Gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_payload_names_kind() {
        let err = GatewayError::NoEligibleTarget("capability:screen_capture".to_string());
        let payload = err.to_payload();
        assert_eq!(payload["kind"], "NoEligibleTarget");
        assert_eq!(
            payload["message"],
            "No eligible target for capability:screen_capture"
        );
    }

    #[test]
    fn test_core_errors_map_onto_taxonomy() {
        let err: GatewayError = CoreError::SessionClosed("session:1".into()).into();
        assert_eq!(err.kind(), ErrorKind::SessionClosed);

        let err: GatewayError = CoreError::InvalidMessage("bad importance".into()).into();
        assert_eq!(err.kind(), ErrorKind::InvalidFrame);
    }
}
