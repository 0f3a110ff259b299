//! Live log streaming.

mod tailer;

pub use tailer::{LogEvent, LogStreamConfig, LogTailer};
