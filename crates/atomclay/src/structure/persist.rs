//! Writing uploaded structures into `inputs/`.

use std::path::PathBuf;

use tokio::fs;
use tracing::{debug, error, info};

use crate::workspace::{WorkspaceError, WorkspaceManager, WorkspaceResult};

use super::models::StructurePayload;

/// Write the payload's content to `inputs/<base name>`.
///
/// Returns `Ok(None)` without touching the disk when the payload has no
/// content or declares a non-positive atom count. An atom count that is not
/// numeric does not block the write. Write failures are returned.
pub async fn persist(
    workspace: &WorkspaceManager,
    payload: &StructurePayload,
) -> WorkspaceResult<Option<PathBuf>> {
    let Some(content) = payload.content.as_deref().filter(|c| !c.is_empty()) else {
        debug!("Structure payload has no content, skipping");
        return Ok(None);
    };

    let atom_count = payload.parsed_atom_count();
    if let Some(count) = atom_count.filter(|count| *count <= 0) {
        debug!(atom_count = count, "Structure payload has no atoms, skipping");
        return Ok(None);
    }

    workspace.ensure_dirs().await?;
    let target = workspace.inputs_dir().join(payload.target_file_name());

    if let Err(source) = fs::write(&target, content).await {
        error!(path = %target.display(), error = %source, "Failed to persist structure file");
        return Err(WorkspaceError::Write {
            path: target,
            source,
        });
    }

    info!(path = %target.display(), atoms = ?atom_count, "Saved structure");
    Ok(Some(target))
}
