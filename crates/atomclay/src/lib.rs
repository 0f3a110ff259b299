//! AtomClay Middleware Library
//!
//! Session-scoped workspace management and a streaming relay in front of the
//! agentom agent server.

pub mod agent;
pub mod api;
pub mod logs;
pub mod session;
pub mod structure;
pub mod workspace;
