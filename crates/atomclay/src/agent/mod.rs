//! Client for the agentom agent server.

mod client;
mod error;
mod types;

pub use client::{AgentClient, AgentConfig};
pub use error::{AgentError, AgentResult};
pub use types::{MessageReply, MessageRequest, SessionProvision};
