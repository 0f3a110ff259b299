//! Locating the newest structure artifact.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};
use tokio::fs;
use tracing::{debug, info};

use crate::workspace::{WorkspaceError, WorkspaceManager, WorkspaceResult};

use super::models::{STRUCTURE_PATTERNS, StructureFile};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: true,
};

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    modified: SystemTime,
}

/// Find the most recently modified structure file in the workspace root or
/// `outputs/`.
///
/// Equal modification times are broken by path: the lexicographically
/// greatest path wins.
pub async fn latest(workspace: &WorkspaceManager) -> WorkspaceResult<Option<StructureFile>> {
    workspace.ensure_dirs().await?;

    let patterns: Vec<Pattern> = STRUCTURE_PATTERNS
        .iter()
        .filter_map(|p| Pattern::new(p).ok())
        .collect();

    let mut candidates = Vec::new();
    for dir in [workspace.root().to_path_buf(), workspace.outputs_dir()] {
        collect_candidates(&dir, &patterns, &mut candidates).await?;
    }
    debug!(count = candidates.len(), "Found structure candidates");

    let Some(best) = candidates.into_iter().max_by(|a, b| {
        a.modified
            .cmp(&b.modified)
            .then_with(|| a.path.cmp(&b.path))
    }) else {
        return Ok(None);
    };

    let content = fs::read_to_string(&best.path)
        .await
        .map_err(|source| WorkspaceError::Read {
            path: best.path.clone(),
            source,
        })?;

    let file_name = best
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let format = best
        .path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();

    info!(path = %best.path.display(), "Selected latest structure");
    Ok(Some(StructureFile {
        path: best.path,
        file_name,
        format,
        modified: DateTime::<Utc>::from(best.modified),
        content,
    }))
}

async fn collect_candidates(
    dir: &Path,
    patterns: &[Pattern],
    out: &mut Vec<Candidate>,
) -> WorkspaceResult<()> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !patterns.iter().any(|p| p.matches_with(name, MATCH_OPTIONS)) {
            continue;
        }

        // Entries can vanish between listing and stat while the agent works.
        let Ok(meta) = fs::metadata(entry.path()).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        out.push(Candidate {
            path: entry.path(),
            modified,
        });
    }
    Ok(())
}
