#![forbid(unsafe_code)]

use std::{
    fmt, io,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    Info,
    Warning,
}

impl fmt::Display for ReportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Warning => f.write_str("warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub ts_unix_ms: u64,
    pub level: ReportLevel,
    pub subject: String,
    pub message: String,
}

impl ReportRecord {
    #[must_use]
    pub fn new(level: ReportLevel, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ts_unix_ms: now_unix_ms().unwrap_or_default(),
            level,
            subject: subject.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn render_plain(&self) -> String {
        format!("[{}] {}: {}", self.level, self.subject, self.message)
    }
}

/// Sink for human-facing output produced by collection operations.
///
/// Operations take the reporter as an argument; there is no global sink.
pub trait Reporter {
    fn report(&mut self, level: ReportLevel, subject: &str, message: &str);

    fn info(&mut self, subject: &str, message: &str) {
        self.report(ReportLevel::Info, subject, message);
    }

    fn warn(&mut self, subject: &str, message: &str) {
        self.report(ReportLevel::Warning, subject, message);
    }
}

impl<R: Reporter + ?Sized> Reporter for &mut R {
    fn report(&mut self, level: ReportLevel, subject: &str, message: &str) {
        (**self).report(level, subject, message);
    }
}

/// In-memory reporter; keeps every record in arrival order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportLedger {
    records: Vec<ReportRecord>,
}

impl ReportLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: ReportRecord) {
        self.records.push(record);
    }

    #[must_use]
    pub fn records(&self) -> &[ReportRecord] {
        &self.records
    }

    pub fn warnings(&self) -> impl Iterator<Item = &ReportRecord> + '_ {
        self.records
            .iter()
            .filter(|record| record.level == ReportLevel::Warning)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn to_json(&self) -> Result<String, RuntimeError> {
        Ok(serde_json::to_string(&self.records)?)
    }
}

impl Reporter for ReportLedger {
    fn report(&mut self, level: ReportLevel, subject: &str, message: &str) {
        self.push(ReportRecord::new(level, subject, message));
    }
}

/// Forwards reports to the active `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&mut self, level: ReportLevel, subject: &str, message: &str) {
        match level {
            ReportLevel::Info => tracing::info!(subject, "{message}"),
            ReportLevel::Warning => tracing::warn!(subject, "{message}"),
        }
    }
}

/// Writes one plain line per report. The first write failure is kept and
/// later reports are dropped.
#[derive(Debug)]
pub struct WriterReporter<W: io::Write> {
    writer: W,
    error: Option<io::Error>,
}

impl<W: io::Write> WriterReporter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            error: None,
        }
    }

    pub fn take_error(&mut self) -> Option<io::Error> {
        self.error.take()
    }

    pub fn into_inner(self) -> Result<W, RuntimeError> {
        match self.error {
            Some(err) => Err(RuntimeError::Write(err)),
            None => Ok(self.writer),
        }
    }
}

impl<W: io::Write> Reporter for WriterReporter<W> {
    fn report(&mut self, level: ReportLevel, subject: &str, message: &str) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = writeln!(self.writer, "[{level}] {subject}: {message}") {
            self.error = Some(err);
        }
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("report sink write failed: {0}")]
    Write(#[source] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}
