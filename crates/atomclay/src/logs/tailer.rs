//! Following the agent's active log file.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::Stream;
use glob::{MatchOptions, Pattern};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::{WorkspaceManager, WorkspaceResult};

const LOG_PATTERN: &str = "*.log";

/// Longest line emitted as a whole; longer lines are split at this length.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Timing of the log stream.
#[derive(Debug, Clone)]
pub struct LogStreamConfig {
    /// How long to wait for a log file to appear before giving up.
    pub wait_timeout: Duration,
    /// Fallback re-check interval when no change notification arrives.
    pub poll_interval: Duration,
}

impl Default for LogStreamConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// One item of a log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A complete line appended to the log, without its line terminator.
    Line(String),
    /// No log file appeared within the wait timeout. Always the last event.
    NoLogs,
    /// Reading failed. Always the last event.
    Error(String),
}

/// Streams lines appended to the newest `*.log` file under `logs/`.
#[derive(Debug, Clone)]
pub struct LogTailer {
    workspace: Arc<WorkspaceManager>,
    config: LogStreamConfig,
    shutdown: CancellationToken,
}

impl LogTailer {
    pub fn new(
        workspace: Arc<WorkspaceManager>,
        config: LogStreamConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            workspace,
            config,
            shutdown,
        }
    }

    /// Prepare a stream for one connection.
    ///
    /// Directory setup happens here, so failures surface before the response
    /// starts. The returned stream waits for a log file, then emits only
    /// lines written after it opened the file. It never ends on its own while
    /// tailing: it stops when dropped or when the shutdown token fires. The
    /// file and the watcher are released when the stream is dropped.
    pub async fn stream(self) -> WorkspaceResult<impl Stream<Item = LogEvent> + Send + 'static> {
        self.workspace.ensure_dirs().await?;

        let logs_dir = self.workspace.logs_dir();
        let tail = Tail {
            wake: Wake::watch(&logs_dir),
            logs_dir,
            config: self.config,
            shutdown: self.shutdown,
            phase: Phase::Waiting,
        };

        Ok(futures::stream::unfold(tail, |mut tail| async move {
            let event = tail.next_event().await?;
            Some((event, tail))
        }))
    }
}

enum Phase {
    Waiting,
    Tailing {
        reader: BufReader<File>,
        /// Bytes of a line whose terminator has not been written yet.
        partial: Vec<u8>,
    },
    Finished,
}

enum Step {
    FindLog,
    Emit(String),
    Idle,
    Fail(String),
}

enum WaitOutcome {
    Found(PathBuf),
    TimedOut,
    Cancelled,
    Failed(io::Error),
}

struct Tail {
    logs_dir: PathBuf,
    config: LogStreamConfig,
    shutdown: CancellationToken,
    wake: Wake,
    phase: Phase,
}

impl Tail {
    async fn next_event(&mut self) -> Option<LogEvent> {
        loop {
            let step = match &mut self.phase {
                Phase::Finished => return None,
                Phase::Waiting => Step::FindLog,
                Phase::Tailing { reader, partial } => {
                    let room = MAX_LINE_BYTES.saturating_sub(partial.len()) as u64;
                    match (&mut *reader).take(room).read_until(b'\n', partial).await {
                        Ok(_) if partial.ends_with(b"\n") || partial.len() >= MAX_LINE_BYTES => {
                            Step::Emit(take_line(partial))
                        }
                        // EOF, possibly in the middle of a line.
                        Ok(_) => Step::Idle,
                        Err(err) => Step::Fail(err.to_string()),
                    }
                }
            };

            match step {
                Step::Emit(line) => return Some(LogEvent::Line(line)),
                Step::Idle => {
                    let interval = self.config.poll_interval;
                    if !self.wake.changed(&self.shutdown, interval).await {
                        debug!("Log stream cancelled");
                        self.phase = Phase::Finished;
                        return None;
                    }
                }
                Step::Fail(message) => {
                    warn!(error = %message, "Error reading log");
                    self.phase = Phase::Finished;
                    return Some(LogEvent::Error(message));
                }
                Step::FindLog => match self.wait_for_log().await {
                    WaitOutcome::Found(path) => match open_at_end(&path).await {
                        Ok(reader) => {
                            info!(path = %path.display(), "Tailing log file");
                            self.phase = Phase::Tailing {
                                reader,
                                partial: Vec::new(),
                            };
                        }
                        Err(err) => {
                            warn!(path = %path.display(), error = %err, "Failed to open log file");
                            self.phase = Phase::Finished;
                            return Some(LogEvent::Error(err.to_string()));
                        }
                    },
                    WaitOutcome::TimedOut => {
                        info!(dir = %self.logs_dir.display(), "No log file appeared");
                        self.phase = Phase::Finished;
                        return Some(LogEvent::NoLogs);
                    }
                    WaitOutcome::Cancelled => {
                        self.phase = Phase::Finished;
                        return None;
                    }
                    WaitOutcome::Failed(err) => {
                        warn!(dir = %self.logs_dir.display(), error = %err, "Failed to list logs");
                        self.phase = Phase::Finished;
                        return Some(LogEvent::Error(err.to_string()));
                    }
                },
            }
        }
    }

    async fn wait_for_log(&mut self) -> WaitOutcome {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            match newest_log(&self.logs_dir).await {
                Ok(Some(path)) => return WaitOutcome::Found(path),
                Ok(None) => {}
                Err(err) => return WaitOutcome::Failed(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let interval = self.config.poll_interval.min(deadline - now);
            if !self.wake.changed(&self.shutdown, interval).await {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

/// Change notifications for the logs directory, with a timer fallback when
/// no watcher could be installed.
struct Wake {
    watcher: Option<RecommendedWatcher>,
    rx: mpsc::Receiver<()>,
}

impl Wake {
    fn watch(dir: &Path) -> Self {
        // Capacity 1: bursts of events collapse into a single wake-up.
        let (tx, rx) = mpsc::channel(1);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.try_send(());
            }
        })
        .and_then(|mut watcher| {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            Ok(watcher)
        });

        match watcher {
            Ok(watcher) => Self {
                watcher: Some(watcher),
                rx,
            },
            Err(err) => {
                debug!(dir = %dir.display(), error = %err, "File watcher unavailable, polling");
                Self { watcher: None, rx }
            }
        }
    }

    /// Wait for a change or `interval`. Returns false once cancelled.
    async fn changed(&mut self, shutdown: &CancellationToken, interval: Duration) -> bool {
        let watching = self.watcher.is_some();
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = self.rx.recv(), if watching => true,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}

async fn open_at_end(path: &Path) -> io::Result<BufReader<File>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::End(0)).await?;
    Ok(BufReader::new(file))
}

fn take_line(partial: &mut Vec<u8>) -> String {
    let bytes = std::mem::take(partial);
    String::from_utf8_lossy(&bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// The most recently created `*.log` file in `dir`.
///
/// Uses modification time on filesystems without birth time.
async fn newest_log(dir: &Path) -> io::Result<Option<PathBuf>> {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let pattern = Pattern::new(LOG_PATTERN).map_err(io::Error::other)?;

    let mut read_dir = match fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name();
        if !name
            .to_str()
            .is_some_and(|name| pattern.matches_with(name, options))
        {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(created) = meta.created().or_else(|_| meta.modified()) else {
            continue;
        };
        let candidate = (created, entry.path());
        if newest.as_ref().is_none_or(|best| candidate > *best) {
            newest = Some(candidate);
        }
    }
    Ok(newest.map(|(_, path)| path))
}
