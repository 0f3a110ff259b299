//! Workspace directory lifecycle: layout, archiving and cleanup.

use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::Serialize;
use serde_json::Value;
use tokio::fs;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use super::error::{WorkspaceError, WorkspaceResult};

pub const INPUTS_DIR: &str = "inputs";
pub const LOGS_DIR: &str = "logs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const TMP_DIR: &str = "tmp";

const DEFAULT_ARCHIVE_DIR: &str = "outputs_archive";
const ARCHIVE_OVERRIDE_KEY: &str = "OUTPUT_ARCHIVE_DIR";
const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const MAX_ARCHIVE_SUFFIX: u32 = 1000;

/// Where the workspace lives on disk.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Workspace root holding `inputs/`, `logs/`, `outputs/` and `tmp/`.
    pub root: PathBuf,
    /// Base for the default archive root and for relative archive overrides.
    pub project_root: PathBuf,
    /// JSON settings file that may carry an `OUTPUT_ARCHIVE_DIR` override.
    pub archive_config: PathBuf,
}

impl WorkspaceConfig {
    /// Conventional layout under a project root:
    /// `<project>/workspace` and `<project>/config/config.json`.
    pub fn under(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        Self {
            root: project_root.join("workspace"),
            archive_config: project_root.join("config").join("config.json"),
            project_root,
        }
    }
}

/// Outcome of moving `outputs/` into a fresh archive directory.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    /// The timestamped directory created for this run.
    pub dir: PathBuf,
    pub archived: usize,
    pub failures: usize,
}

impl ArchiveReport {
    /// Name of the archive directory, e.g. `20240101_120000`.
    pub fn archive_name(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Outcome of a full workspace reset.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub archive: ArchiveReport,
    /// Entries deleted from inputs/outputs/tmp and the workspace root.
    pub removed: usize,
    /// Deletions that failed and were skipped.
    pub failures: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    done: usize,
    failed: usize,
}

impl Tally {
    fn merge(&mut self, other: Tally) {
        self.done += other.done;
        self.failed += other.failed;
    }
}

/// Owns the shared workspace directory tree.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    config: WorkspaceConfig,
}

impl WorkspaceManager {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn inputs_dir(&self) -> PathBuf {
        self.config.root.join(INPUTS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.config.root.join(LOGS_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.config.root.join(OUTPUTS_DIR)
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.config.root.join(TMP_DIR)
    }

    /// Create the four workspace directories if they are missing.
    pub async fn ensure_dirs(&self) -> WorkspaceResult<()> {
        for dir in [
            self.inputs_dir(),
            self.logs_dir(),
            self.outputs_dir(),
            self.tmp_dir(),
        ] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|source| WorkspaceError::CreateDir { path: dir, source })?;
        }
        Ok(())
    }

    /// Resolve the archive root, honouring the JSON settings override.
    ///
    /// An override inside the workspace root is ignored, since cleanup would
    /// delete the archive along with the workspace.
    pub async fn archive_root(&self) -> PathBuf {
        let default = self.config.project_root.join(DEFAULT_ARCHIVE_DIR);
        let Some(path) = read_archive_override(&self.config.archive_config).await else {
            return default;
        };

        let path = self.config.project_root.join(path);
        if path.starts_with(&self.config.root) {
            warn!(
                path = %path.display(),
                "Ignoring {} inside the workspace, using the default archive root",
                ARCHIVE_OVERRIDE_KEY
            );
            return default;
        }
        path
    }

    /// Move every entry of `outputs/` into a new timestamped archive directory.
    ///
    /// Only failing to create the archive directory is an error. Each entry
    /// is moved independently and a failed move is logged and skipped.
    pub async fn archive(&self) -> WorkspaceResult<ArchiveReport> {
        info!("Archiving workspace outputs");

        let archive_root = self.archive_root().await;
        let dir = create_archive_dir(&archive_root).await?;
        let moved = move_dir_contents(&self.outputs_dir(), &dir).await;
        let report = ArchiveReport {
            dir,
            archived: moved.done,
            failures: moved.failed,
        };

        info!(
            archive_dir = %report.dir.display(),
            archived = report.archived,
            failures = report.failures,
            "Transferred outputs to archive"
        );
        Ok(report)
    }

    /// Archive outputs, then clear inputs/outputs/tmp and the top-level
    /// files of the workspace root.
    pub async fn cleanup(&self) -> WorkspaceResult<CleanupReport> {
        info!(root = %self.config.root.display(), "Cleaning up workspace");

        let mut tally = Tally::default();
        if let Err(err) = self.ensure_dirs().await {
            warn!(error = %err, "Failed to prepare workspace directories before cleanup");
            tally.failed += 1;
        }

        let archive = self.archive().await?;

        for dir in [self.inputs_dir(), self.outputs_dir(), self.tmp_dir()] {
            tally.merge(clear_dir_contents(&dir).await);
            debug!(dir = %dir.display(), "Cleared directory");
        }
        tally.merge(remove_top_level_files(&self.config.root).await);

        if let Err(err) = self.ensure_dirs().await {
            warn!(error = %err, "Failed to recreate workspace directories after cleanup");
            tally.failed += 1;
        }

        let report = CleanupReport {
            archive,
            removed: tally.done,
            failures: tally.failed,
        };
        info!(
            archived = report.archive.archived,
            removed = report.removed,
            failures = report.failures + report.archive.failures,
            "Workspace cleanup complete"
        );
        Ok(report)
    }

    /// Replace the JSON settings file consulted for the archive override.
    pub async fn save_settings(&self, settings: &Value) -> WorkspaceResult<()> {
        let path = &self.config.archive_config;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| WorkspaceError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let mut body = serde_json::to_string_pretty(settings).map_err(io::Error::other)?;
        body.push('\n');
        fs::write(path, body)
            .await
            .map_err(|source| WorkspaceError::Write {
                path: path.clone(),
                source,
            })?;
        info!(path = %path.display(), "Saved settings");
        Ok(())
    }
}

async fn read_archive_override(config_file: &Path) -> Option<PathBuf> {
    let raw = match fs::read_to_string(config_file).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %config_file.display(), error = %err, "Failed to read settings file");
            return None;
        }
    };

    let value: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %config_file.display(), error = %err, "Ignoring malformed settings file");
            return None;
        }
    };

    match value.get(ARCHIVE_OVERRIDE_KEY) {
        None | Some(Value::Null) => None,
        Some(Value::String(dir)) if !dir.trim().is_empty() => Some(PathBuf::from(dir)),
        Some(other) => {
            warn!(value = %other, "Ignoring invalid {}", ARCHIVE_OVERRIDE_KEY);
            None
        }
    }
}

/// Create `<root>/<timestamp>`, appending `_<n>` when that name is taken.
async fn create_archive_dir(root: &Path) -> WorkspaceResult<PathBuf> {
    fs::create_dir_all(root)
        .await
        .map_err(|source| WorkspaceError::ArchiveDir {
            path: root.to_path_buf(),
            source,
        })?;

    let stamp = Local::now().format(ARCHIVE_TIMESTAMP_FORMAT).to_string();
    let mut candidate = root.join(&stamp);
    for suffix in 1..=MAX_ARCHIVE_SUFFIX {
        match fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                candidate = root.join(format!("{stamp}_{suffix}"));
            }
            Err(source) => {
                return Err(WorkspaceError::ArchiveDir {
                    path: candidate,
                    source,
                });
            }
        }
    }

    Err(WorkspaceError::ArchiveDir {
        path: candidate,
        source: io::Error::new(
            io::ErrorKind::AlreadyExists,
            "no free archive directory name",
        ),
    })
}

/// List a directory up front so entries can be moved or deleted while
/// iterating. A missing directory has no entries.
async fn read_entries(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        entries.push(entry);
    }
    Ok(entries)
}

/// Move each entry of `src_dir` into `dest_dir`, independently.
async fn move_dir_contents(src_dir: &Path, dest_dir: &Path) -> Tally {
    let mut tally = Tally::default();
    let entries = match read_entries(src_dir).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(dir = %src_dir.display(), error = %err, "Failed to list outputs");
            tally.failed += 1;
            return tally;
        }
    };

    for entry in entries {
        let src = entry.path();
        let dest = dest_dir.join(entry.file_name());
        match move_entry(&src, &dest).await {
            Ok(()) => {
                debug!(from = %src.display(), to = %dest.display(), "Archived entry");
                tally.done += 1;
            }
            Err(err) => {
                error!(path = %src.display(), error = %err, "Failed to move entry to archive");
                tally.failed += 1;
            }
        }
    }
    tally
}

async fn move_entry(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            debug!(from = %src.display(), "Archive is on another filesystem, copying");
            let (src, dest) = (src.to_path_buf(), dest.to_path_buf());
            tokio::task::spawn_blocking(move || copy_then_remove(&src, &dest))
                .await
                .map_err(io::Error::other)?
        }
        Err(err) => Err(err),
    }
}

fn copy_then_remove(src: &Path, dest: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    if !meta.is_dir() {
        std::fs::copy(src, dest)?;
        return std::fs::remove_file(src);
    }

    for entry in WalkDir::new(src) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    std::fs::remove_dir_all(src)
}

async fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path).await?;
    if meta.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    }
}

async fn clear_dir_contents(dir: &Path) -> Tally {
    let mut tally = Tally::default();
    let entries = match read_entries(dir).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(dir = %dir.display(), error = %err, "Failed to list directory for cleanup");
            tally.failed += 1;
            return tally;
        }
    };

    for entry in entries {
        let path = entry.path();
        match remove_entry(&path).await {
            Ok(()) => tally.done += 1,
            Err(err) => {
                error!(path = %path.display(), error = %err, "Failed to delete entry");
                tally.failed += 1;
            }
        }
    }
    tally
}

/// Delete files and symlinks directly under `root`; subdirectories stay.
async fn remove_top_level_files(root: &Path) -> Tally {
    let mut tally = Tally::default();
    let entries = match read_entries(root).await {
        Ok(entries) => entries,
        Err(err) => {
            error!(dir = %root.display(), error = %err, "Failed to list workspace root");
            tally.failed += 1;
            return tally;
        }
    };

    for entry in entries {
        let path = entry.path();
        let is_file = match entry.file_type().await {
            Ok(file_type) => file_type.is_file() || file_type.is_symlink(),
            Err(err) => {
                error!(path = %path.display(), error = %err, "Failed to stat entry");
                tally.failed += 1;
                continue;
            }
        };
        if !is_file {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => tally.done += 1,
            Err(err) => {
                error!(path = %path.display(), error = %err, "Failed to delete file in workspace root");
                tally.failed += 1;
            }
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> WorkspaceManager {
        WorkspaceManager::new(WorkspaceConfig::under(tmp.path()))
    }

    fn archive_dirs(root: &Path) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default();
        dirs.sort();
        dirs
    }

    fn is_empty_dir(path: &Path) -> bool {
        std::fs::read_dir(path).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_ensure_dirs_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);

        ws.ensure_dirs().await.unwrap();
        std::fs::write(ws.inputs_dir().join("keep.cif"), "x").unwrap();
        ws.ensure_dirs().await.unwrap();

        for dir in [ws.inputs_dir(), ws.logs_dir(), ws.outputs_dir(), ws.tmp_dir()] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
        assert!(ws.inputs_dir().join("keep.cif").exists());
    }

    #[tokio::test]
    async fn test_cleanup_archives_outputs_and_clears_workspace() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        ws.ensure_dirs().await.unwrap();

        std::fs::write(ws.outputs_dir().join("final.cif"), "cif").unwrap();
        std::fs::create_dir(ws.outputs_dir().join("relax")).unwrap();
        std::fs::write(ws.outputs_dir().join("relax").join("OUTCAR"), "out").unwrap();
        std::fs::write(ws.inputs_dir().join("input.poscar"), "in").unwrap();
        std::fs::create_dir(ws.tmp_dir().join("scratch")).unwrap();
        std::fs::write(ws.root().join("notes.xyz"), "root").unwrap();
        std::fs::write(ws.logs_dir().join("agent.log"), "line\n").unwrap();

        let report = ws.cleanup().await.unwrap();

        assert_eq!(report.archive.archived, 2);
        assert_eq!(report.archive.failures, 0);
        assert_eq!(report.failures, 0);
        // input.poscar, scratch/, notes.xyz
        assert_eq!(report.removed, 3);

        for dir in [ws.inputs_dir(), ws.outputs_dir(), ws.tmp_dir()] {
            assert!(dir.is_dir());
            assert!(is_empty_dir(&dir), "{} not empty", dir.display());
        }
        assert!(!ws.root().join("notes.xyz").exists());
        assert!(ws.logs_dir().join("agent.log").exists());

        let archives = archive_dirs(&tmp.path().join("outputs_archive"));
        assert_eq!(archives, vec![report.archive.dir.clone()]);
        assert_eq!(
            std::fs::read_to_string(report.archive.dir.join("final.cif")).unwrap(),
            "cif"
        );
        assert!(report.archive.dir.join("relax").join("OUTCAR").exists());
    }

    #[tokio::test]
    async fn test_archive_dir_name_is_timestamp() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        ws.ensure_dirs().await.unwrap();

        let report = ws.archive().await.unwrap();
        let name = report.archive_name();
        assert_eq!(name.len(), "20240101_120000".len());
        assert!(chrono::NaiveDateTime::parse_from_str(&name, ARCHIVE_TIMESTAMP_FORMAT).is_ok());
    }

    #[tokio::test]
    async fn test_archive_dirs_are_never_reused() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        ws.ensure_dirs().await.unwrap();

        std::fs::write(ws.outputs_dir().join("a.cif"), "a").unwrap();
        let first = ws.archive().await.unwrap();
        std::fs::write(ws.outputs_dir().join("a.cif"), "b").unwrap();
        let second = ws.archive().await.unwrap();

        assert_ne!(first.dir, second.dir);
        assert_eq!(std::fs::read_to_string(first.dir.join("a.cif")).unwrap(), "a");
        assert_eq!(std::fs::read_to_string(second.dir.join("a.cif")).unwrap(), "b");
    }

    #[tokio::test]
    async fn test_archive_root_override_relative_and_absolute() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);

        assert_eq!(ws.archive_root().await, tmp.path().join("outputs_archive"));

        ws.save_settings(&serde_json::json!({ "OUTPUT_ARCHIVE_DIR": "runs/archive" }))
            .await
            .unwrap();
        assert_eq!(ws.archive_root().await, tmp.path().join("runs/archive"));

        let absolute = tmp.path().join("elsewhere");
        ws.save_settings(&serde_json::json!({ "OUTPUT_ARCHIVE_DIR": absolute }))
            .await
            .unwrap();
        assert_eq!(ws.archive_root().await, absolute);
    }

    #[tokio::test]
    async fn test_malformed_settings_fall_back_to_default_root() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        let settings = &ws.config().archive_config;
        std::fs::create_dir_all(settings.parent().unwrap()).unwrap();
        std::fs::write(settings, "{ not json").unwrap();

        assert_eq!(ws.archive_root().await, tmp.path().join("outputs_archive"));

        std::fs::write(settings, r#"{"OUTPUT_ARCHIVE_DIR": 42}"#).unwrap();
        assert_eq!(ws.archive_root().await, tmp.path().join("outputs_archive"));
    }

    #[tokio::test]
    async fn test_archive_root_creation_failure_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        ws.ensure_dirs().await.unwrap();

        // A regular file where the archive root should be.
        std::fs::write(tmp.path().join("outputs_archive"), "blocker").unwrap();
        std::fs::write(ws.outputs_dir().join("keep.cif"), "x").unwrap();

        let err = ws.cleanup().await.unwrap_err();
        assert!(matches!(err, WorkspaceError::ArchiveDir { .. }));
        // Nothing was deleted because the archive step failed first.
        assert!(ws.outputs_dir().join("keep.cif").exists());
    }

    #[tokio::test]
    async fn test_archive_root_inside_workspace_falls_back_to_default() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        ws.ensure_dirs().await.unwrap();
        ws.save_settings(&serde_json::json!({ "OUTPUT_ARCHIVE_DIR": "workspace/outputs/arch" }))
            .await
            .unwrap();

        let default = tmp.path().join("outputs_archive");
        assert_eq!(ws.archive_root().await, default);

        std::fs::write(ws.outputs_dir().join("final.cif"), "cif").unwrap();
        let report = ws.cleanup().await.unwrap();
        assert!(report.archive.dir.starts_with(&default));
        assert_eq!(
            std::fs::read_to_string(report.archive.dir.join("final.cif")).unwrap(),
            "cif"
        );
    }

    #[tokio::test]
    async fn test_failed_move_does_not_stop_the_others() {
        let tmp = TempDir::new().unwrap();
        let outputs = tmp.path().join("outputs");
        let nested = outputs.join("arch");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(outputs.join("a.cif"), "a").unwrap();
        std::fs::write(outputs.join("b.cif"), "b").unwrap();

        // `arch` cannot be moved into itself; the two files still move.
        let tally = move_dir_contents(&outputs, &nested).await;

        assert_eq!(tally.done, 2);
        assert_eq!(tally.failed, 1);
        assert!(nested.join("a.cif").exists());
        assert!(nested.join("b.cif").exists());
        assert!(!outputs.join("a.cif").exists());
    }

    #[tokio::test]
    async fn test_cleanup_counts_failures_and_keeps_going() {
        let tmp = TempDir::new().unwrap();
        let ws = manager(&tmp);
        std::fs::create_dir_all(ws.root()).unwrap();
        // A regular file where `tmp/` belongs: it can be neither created
        // nor listed, but it is removed as a top-level file.
        std::fs::write(ws.tmp_dir(), "blocker").unwrap();

        let report = ws.cleanup().await.unwrap();
        assert_eq!(report.failures, 2);
        assert_eq!(report.removed, 1);

        for dir in [ws.inputs_dir(), ws.logs_dir(), ws.outputs_dir(), ws.tmp_dir()] {
            assert!(dir.is_dir(), "{} missing", dir.display());
        }
    }

    #[test]
    fn test_copy_then_remove_moves_directory_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("nested")).unwrap();
        std::fs::write(src.join("top.txt"), "top").unwrap();
        std::fs::write(src.join("nested").join("deep.txt"), "deep").unwrap();

        let dest = tmp.path().join("dest");
        copy_then_remove(&src, &dest).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read_to_string(dest.join("top.txt")).unwrap(), "top");
        assert_eq!(
            std::fs::read_to_string(dest.join("nested").join("deep.txt")).unwrap(),
            "deep"
        );
    }
}
