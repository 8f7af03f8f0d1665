//! Injected logging capability.
//!
//! The sandbox template, the facades and the state codec never log through an
//! ambient global; they receive an `Arc<dyn ScriptLog>` at construction.
//! [`TracingLog`] forwards to `tracing`, [`RecordingLog`] keeps entries in
//! memory so callers can assert on them.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Sink for sandbox and script log output.
pub trait ScriptLog: Send + Sync {
    /// Record one entry. `source` names the emitting component
    /// (`"script"`, `"facade"`, `"codec"`, ...).
    fn log(&self, level: LogLevel, source: &str, message: &str);

    fn debug(&self, source: &str, message: &str) {
        self.log(LogLevel::Debug, source, message);
    }

    fn info(&self, source: &str, message: &str) {
        self.log(LogLevel::Info, source, message);
    }

    fn warn(&self, source: &str, message: &str) {
        self.log(LogLevel::Warn, source, message);
    }

    fn error(&self, source: &str, message: &str) {
        self.log(LogLevel::Error, source, message);
    }
}

/// Shared handle to a log sink.
pub type SharedLog = Arc<dyn ScriptLog>;

/// Forwards entries to `tracing` with structured fields.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl ScriptLog for TracingLog {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(event = "flowscript.log", source = %source, "{message}"),
            LogLevel::Info => tracing::info!(event = "flowscript.log", source = %source, "{message}"),
            LogLevel::Warn => tracing::warn!(event = "flowscript.log", source = %source, "{message}"),
            LogLevel::Error => tracing::error!(event = "flowscript.log", source = %source, "{message}"),
        }
    }
}

/// One captured entry of a [`RecordingLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

/// In-memory sink. Also forwards to `tracing` so output is not lost.
#[derive(Debug, Default)]
pub struct RecordingLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl RecordingLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry recorded so far.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    /// Entries at exactly `level`.
    pub fn at_level(&self, level: LogLevel) -> Vec<LogEntry> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.level == level)
            .collect()
    }

    pub fn warning_count(&self) -> usize {
        self.at_level(LogLevel::Warn).len()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl ScriptLog for RecordingLog {
    fn log(&self, level: LogLevel, source: &str, message: &str) {
        TracingLog.log(level, source, message);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(LogEntry {
                level,
                source: source.to_string(),
                message: message.to_string(),
            });
        }
    }
}
