//! Typed errors for the streaming and reconciliation paths.
//!
//! Transport and configuration plumbing stays on `anyhow`; these are the
//! failures callers branch on.

use thiserror::Error;

/// Fallback shown when the backend gives no usable error text.
pub const GENERIC_ERROR: &str =
    "An error occurred. Please try again. If the problem persists, please contact the site administrator.";

/// Conversation-level preconditions that abort an exchange before or after streaming.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// The exchange references a conversation absent from the current state.
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Another exchange is already streaming into this conversation.
    #[error("An exchange is already in progress for conversation {0}")]
    ExchangeInProgress(String),
}

/// Failures that end the stream of the current exchange.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A record carried a populated `error` field.
    #[error("Backend reported an error: {}", .message.as_deref().unwrap_or("<no message>"))]
    Backend { message: Option<String> },

    /// A record was valid JSON but not a stream record.
    #[error("Malformed stream record: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The request or a body read failed.
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl StreamError {
    /// Text for the `error` message appended to the transcript.
    pub fn display_text(&self) -> String {
        match self {
            StreamError::Backend { message: Some(message) } => message.clone(),
            _ => GENERIC_ERROR.to_string(),
        }
    }
}
