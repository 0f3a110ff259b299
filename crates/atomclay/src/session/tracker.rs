//! Active-session pointer and workspace reset on session change.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::workspace::{WorkspaceManager, WorkspaceResult};

use super::models::SessionTransition;

/// Tracks the single active session of the process.
///
/// Transitions are serialized: the lock is held across the whole
/// compare/cleanup/store sequence, so two requests with different session ids
/// cannot run overlapping cleanups. Other workspace writers (structure uploads,
/// the agent itself) do not take this lock. A request for session A can still
/// write into the workspace while a request for session B is clearing it, and
/// that file is then lost or survives into B. Only one session is supported at
/// a time.
#[derive(Debug)]
pub struct SessionTracker {
    active: Mutex<Option<String>>,
    workspace: Arc<WorkspaceManager>,
}

impl SessionTracker {
    pub fn new(workspace: Arc<WorkspaceManager>) -> Self {
        Self {
            active: Mutex::new(None),
            workspace,
        }
    }

    /// Current active session id, if any session has been seen.
    pub async fn active_session(&self) -> Option<String> {
        self.active.lock().await.clone()
    }

    /// Reset the workspace if `session_id` differs from the active session.
    ///
    /// The first session seen by a fresh process counts as a change. The
    /// pointer is only updated once cleanup succeeded, so a failed reset is
    /// retried by the next request.
    pub async fn check_new_session(&self, session_id: &str) -> WorkspaceResult<SessionTransition> {
        let mut active = self.active.lock().await;
        if active.as_deref() == Some(session_id) {
            return Ok(SessionTransition::Unchanged);
        }

        info!(
            session_id = %session_id,
            previous = active.as_deref().unwrap_or("none"),
            "New session detected"
        );
        let report = self.workspace.cleanup().await?;
        let previous = active.replace(session_id.to_string());
        Ok(SessionTransition::Started { previous, report })
    }

    /// Unconditionally reset the workspace and make `session_id` active.
    pub async fn begin_session(&self, session_id: &str) -> WorkspaceResult<SessionTransition> {
        let mut active = self.active.lock().await;
        let report = self.workspace.cleanup().await?;
        let previous = active.replace(session_id.to_string());
        info!(session_id = %session_id, "Started fresh session");
        Ok(SessionTransition::Started { previous, report })
    }
}
