//! Operator log
//!
//! Timestamped, user-visible record of everything the session did. Each line
//! is mirrored to `tracing` at the matching level.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info, warn};

/// Severity of an operator log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One line of the operator log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub at: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}",
            self.at.format("%H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Ordered operator log
#[derive(Debug, Clone, Default)]
pub struct OperatorLog {
    lines: Vec<LogLine>,
}

impl OperatorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line and emit it as a tracing event
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => info!(target: "zephyr::oplog", "{}", message),
            LogLevel::Warn => warn!(target: "zephyr::oplog", "{}", message),
            LogLevel::Error => error!(target: "zephyr::oplog", "{}", message),
        }
        self.lines.push(LogLine {
            at: Local::now(),
            level,
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.push(LogLevel::Error, message);
    }

    /// All lines, oldest first
    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    /// Lines appended after the first `cursor` lines.
    ///
    /// Callers keep `cursor` as the length they last saw.
    pub fn since(&self, cursor: usize) -> &[LogLine] {
        self.lines.get(cursor..).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
