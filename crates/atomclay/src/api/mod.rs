//! HTTP API module.
//!
//! Workspace, session and structure endpoints plus the streamed agent relay.

mod error;
mod handlers;
mod proxy;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{AppState, ServerOptions};
