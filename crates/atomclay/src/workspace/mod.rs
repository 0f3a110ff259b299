//! Shared on-disk workspace of the agent.
//!
//! The workspace holds the working files of the current session only.
//! Between sessions its outputs are archived and everything else is cleared.

mod error;
mod manager;

pub use error::{WorkspaceError, WorkspaceResult};
pub use manager::{
    ArchiveReport, CleanupReport, INPUTS_DIR, LOGS_DIR, OUTPUTS_DIR, TMP_DIR, WorkspaceConfig,
    WorkspaceManager,
};
