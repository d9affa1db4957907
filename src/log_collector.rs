//! Central collection of component log records.
//!
//! The run controller forwards every status change and every error it observes to a
//! [`LogCollector`]. Collectors are a registry role; `memory` keeps a bounded buffer and
//! `file` appends one JSON object per line.

use crate::config::LogCollectorConfig;
use crate::error::{AppResult, DaqError};
use crate::registry::Registry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::warn;

/// Severity of a [`LogRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Normal operation
    Info,
    /// Something needs attention
    Warn,
    /// A command or component failed
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One forwarded log message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Severity
    pub level: LogLevel,
    /// Component the message is about
    pub sender: String,
    /// Message text
    pub message: String,
    /// When the record was created
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Record stamped with the current time.
    pub fn new(level: LogLevel, sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            sender: sender.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Sink for forwarded log records.
pub trait LogCollector: Send + Sync {
    /// Store one record.
    fn log(&self, record: LogRecord);

    /// Records still held by the collector, oldest first.
    fn records(&self) -> Vec<LogRecord> {
        Vec::new()
    }

    /// Push buffered records to their destination.
    fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

/// Keeps the most recent records in memory.
pub struct MemoryLogCollector {
    capacity: usize,
    records: Mutex<VecDeque<LogRecord>>,
}

impl MemoryLogCollector {
    /// Collector holding at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }
}

impl LogCollector for MemoryLogCollector {
    fn log(&self, record: LogRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

/// Appends records to a JSON lines file.
pub struct FileLogCollector {
    writer: Mutex<BufWriter<File>>,
}

impl FileLogCollector {
    /// Open `config.path` for appending.
    pub fn open(config: &LogCollectorConfig) -> AppResult<Self> {
        let path = config.path.as_ref().ok_or_else(|| {
            DaqError::Configuration("log_collector.path is required by the file collector".into())
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl LogCollector for FileLogCollector {
    fn log(&self, record: LogRecord) {
        let mut writer = self.writer.lock();
        let written = serde_json::to_writer(&mut *writer, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| writeln!(writer));
        if let Err(e) = written {
            warn!(error = %e, "cannot write log record");
        }
    }

    fn flush(&self) -> AppResult<()> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileLogCollector {
    fn drop(&mut self) {
        let _ = self.writer.get_mut().flush();
    }
}

/// Register the built-in log collectors.
pub fn register(registry: &mut Registry) -> AppResult<()> {
    registry.register_log_collector("memory", |config| {
        Ok(Arc::new(MemoryLogCollector::new(config.capacity)) as Arc<dyn LogCollector>)
    })?;
    registry.register_log_collector("file", |config| {
        Ok(Arc::new(FileLogCollector::open(config)?) as Arc<dyn LogCollector>)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_collector_is_bounded() {
        let collector = MemoryLogCollector::new(2);
        for i in 0..3 {
            collector.log(LogRecord::new(LogLevel::Info, "rc", format!("message {i}")));
        }
        let records = collector.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "message 1");
        assert_eq!(records[1].message, "message 2");
    }

    #[test]
    fn test_file_collector_writes_json_lines() {
        let dir = tempdir().unwrap();
        let config = LogCollectorConfig {
            kind: "file".into(),
            capacity: 0,
            path: Some(dir.path().join("logs").join("run.jsonl")),
        };
        let collector = FileLogCollector::open(&config).unwrap();
        collector.log(LogRecord::new(LogLevel::Error, "CMSREF", "hardware fault"));
        collector.log(LogRecord::new(LogLevel::Info, "CMSREF", "Configured"));
        collector.flush().unwrap();

        let text = std::fs::read_to_string(config.path.as_ref().unwrap()).unwrap();
        let lines: Vec<LogRecord> = text
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].level, LogLevel::Error);
        assert_eq!(lines[1].message, "Configured");
    }

    #[test]
    fn test_file_collector_requires_path() {
        let config = LogCollectorConfig {
            kind: "file".into(),
            capacity: 10,
            path: None,
        };
        assert!(matches!(
            FileLogCollector::open(&config),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_builtin_collectors_from_registry() {
        let mut registry = Registry::new();
        register(&mut registry).unwrap();
        let config = LogCollectorConfig {
            kind: "memory".into(),
            capacity: 4,
            path: None,
        };
        let collector = registry.create_log_collector(&config).unwrap();
        collector.log(LogRecord::new(LogLevel::Warn, "dc", "slow"));
        assert_eq!(collector.records().len(), 1);
    }
}
