//! Agent API types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body sent to the session endpoint to deliver a user message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageRequest<'a> {
    pub message: &'a str,
}

/// Reply of the session endpoint. Only `response` is interpreted.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct MessageReply(pub Value);

impl MessageReply {
    /// The `response` field when it is a string, otherwise the whole reply
    /// rendered as JSON text.
    pub fn into_text(self) -> String {
        match self.0.get("response") {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => self.0.to_string(),
        }
    }
}

/// Outcome of a best-effort session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionProvision {
    Created,
    AlreadyExists,
    /// The agent could not be reached or refused the request.
    Unreachable,
}
