//! Agent client error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Result type for agent operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Errors that can occur talking to the agent server.
#[derive(Debug, Error)]
pub enum AgentError {
    /// HTTP request failed.
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// The agent server answered with a non-success status.
    #[error("agent returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// Connection failed.
    #[error("Failed to connect to agent at {url}: {message}")]
    ConnectionFailed { url: String, message: String },

    /// Failed to parse response.
    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

impl AgentError {
    pub(super) fn connection(url: &str, err: reqwest::Error) -> Self {
        Self::ConnectionFailed {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}
