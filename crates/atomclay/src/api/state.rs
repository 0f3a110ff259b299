//! Application state shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::AgentClient;
use crate::logs::{LogStreamConfig, LogTailer};
use crate::session::SessionTracker;
use crate::workspace::WorkspaceManager;

/// Server-side settings of the HTTP layer.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Allowed CORS origins. Empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Interval of keep-alive comments on log streams.
    pub keepalive: Duration,
    pub logs: LogStreamConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            cors_origins: Vec::new(),
            keepalive: Duration::from_secs(15),
            logs: LogStreamConfig::default(),
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub workspace: Arc<WorkspaceManager>,
    pub sessions: Arc<SessionTracker>,
    pub agent: AgentClient,
    pub options: ServerOptions,
    /// Fired on graceful shutdown; ends open log streams.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        workspace: WorkspaceManager,
        agent: AgentClient,
        options: ServerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let workspace = Arc::new(workspace);
        Self {
            sessions: Arc::new(SessionTracker::new(workspace.clone())),
            workspace,
            agent,
            options,
            shutdown,
        }
    }

    pub fn log_tailer(&self) -> LogTailer {
        LogTailer::new(
            self.workspace.clone(),
            self.options.logs.clone(),
            self.shutdown.clone(),
        )
    }
}
