//! Decision log
//!
//! Every exclusion, count and model comparison is emitted as a `tracing`
//! event and kept in memory so the stage can persist a plain-text log next
//! to its output tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::error::PipelineError;
use crate::types::TableCounts;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One logged decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Running log of one stage's decisions
#[derive(Debug, Clone)]
pub struct DecisionLog {
    stage: &'static str,
    entries: Vec<LogEntry>,
}

impl DecisionLog {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            entries: Vec::new(),
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(stage = self.stage, "{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(stage = self.stage, "{}", message);
        self.push(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(stage = self.stage, "{}", message);
        self.push(LogLevel::Error, message);
    }

    /// Log the row/user counts after a step
    pub fn counts(&mut self, step: &str, counts: TableCounts) {
        self.info(format!("{step}: {counts}."));
    }

    /// Log the before/after delta of a filtering step
    pub fn delta(&mut self, step: &str, before: TableCounts, after: TableCounts) {
        self.info(format!(
            "{step}: removed {} trials and {} users; {after} remain.",
            before.rows.saturating_sub(after.rows),
            before.users.saturating_sub(after.users),
        ));
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.entries.push(LogEntry {
            at: Utc::now(),
            level,
            message,
        });
    }

    /// Messages without timestamps, in order
    pub fn messages(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.message.as_str()).collect()
    }

    /// Write `<timestamp> - <LEVEL> - <message>` lines
    pub fn write_to(&self, path: &Path) -> Result<(), PipelineError> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        for entry in &self.entries {
            writeln!(
                file,
                "{} - {} - {}",
                entry.at.format("%Y-%m-%d %H:%M:%S"),
                entry.level,
                entry.message
            )?;
        }
        file.flush()?;
        Ok(())
    }
}

/// `<prefix>_<YYYYmmdd_HHMMSS>.txt`
pub fn timestamped_log_name(prefix: &str) -> String {
    format!("{}_{}.txt", prefix, Utc::now().format("%Y%m%d_%H%M%S"))
}
