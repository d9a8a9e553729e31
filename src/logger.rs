//! Run logging with an injectable sink.
//!
//! Every component writes severity-tagged entries through a `RunLogger`
//! handle. In production the sink appends to a timestamp-named run log and
//! echoes to the console; tests swap in a memory sink and inspect entries
//! without touching the filesystem.
//!
//! Opening a logger also maintains the stable per-service log files and
//! prunes run logs older than the retention window.

use chrono::{NaiveDateTime, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strum::Display;

use crate::error::Result;

/// Log entry severity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// One structured log entry
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub severity: Severity,
    pub component: String,
    pub message: String,
}

/// Destination for log entries.
///
/// The orchestrator writes through this trait so tests can capture output
/// in memory instead of on disk.
pub trait LogSink: Send {
    fn write(&mut self, entry: &LogEntry);
}

/// Stable per-service log files maintained alongside the run logs
const STACK_SERVICE_LOGS: &[&str] = &[
    "postfix.log",
    "dovecot.log",
    "opendkim.log",
    "nginx.log",
    "postgresql.log",
];

const RUN_LOG_PREFIX: &str = "deploy-";
const RUN_LOG_SUFFIX: &str = ".log";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

struct FileSink {
    file: File,
}

impl LogSink for FileSink {
    fn write(&mut self, entry: &LogEntry) {
        let line = format!(
            "[{}] [{}] [{}] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            entry.severity,
            entry.component,
            entry.message
        );
        // Dual write: run log file plus console, like the shell logger the
        // orchestrator replaces
        if let Err(e) = writeln!(self.file, "{}", line) {
            tracing::warn!("Failed to append to run log: {}", e);
        }
        match entry.severity {
            Severity::Warning | Severity::Error => eprintln!("{}", line),
            _ => println!("{}", line),
        }
    }
}

struct MemorySink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl LogSink for MemorySink {
    fn write(&mut self, entry: &LogEntry) {
        self.entries
            .lock()
            .expect("MemorySink mutex poisoned")
            .push(entry.clone());
    }
}

/// Structured end-of-run summary written by `RunLogger::finish`
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Final status label (e.g., "success", "task_failed_rolled_back")
    pub status_label: String,
    /// Whether the run succeeded
    pub succeeded: bool,
    /// Key facts, in display order
    pub facts: Vec<(String, String)>,
    /// Troubleshooting checklist shown on failure
    pub troubleshooting: Vec<String>,
}

/// Cloneable handle to the process-wide run log.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<Mutex<Box<dyn LogSink>>>,
    run_log_path: Option<PathBuf>,
}

impl RunLogger {
    /// Open the run log for a new deployment run.
    ///
    /// Creates `log_dir` if missing, starts a timestamp-named run log,
    /// ensures the stable per-service log files exist, and prunes run logs
    /// older than `retention_days`.
    pub fn open(log_dir: &Path, retention_days: u64) -> Result<Self> {
        fs::create_dir_all(log_dir)?;

        let pruned = prune_run_logs(log_dir, retention_days)?;
        if pruned > 0 {
            tracing::debug!("Pruned {} run log(s) past retention", pruned);
        }

        for name in STACK_SERVICE_LOGS {
            let path = log_dir.join(name);
            if !path.exists() {
                OpenOptions::new().create(true).append(true).open(&path)?;
            }
        }

        let run_log_path = log_dir.join(format!(
            "{}{}{}",
            RUN_LOG_PREFIX,
            Utc::now().format(STAMP_FORMAT),
            RUN_LOG_SUFFIX
        ));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&run_log_path)?;

        Ok(Self {
            sink: Arc::new(Mutex::new(Box::new(FileSink { file }))),
            run_log_path: Some(run_log_path),
        })
    }

    /// Create a logger backed by an in-memory sink, returning the shared
    /// entry buffer for inspection.
    pub fn memory() -> (Self, Arc<Mutex<Vec<LogEntry>>>) {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let logger = Self {
            sink: Arc::new(Mutex::new(Box::new(MemorySink {
                entries: Arc::clone(&entries),
            }))),
            run_log_path: None,
        };
        (logger, entries)
    }

    /// Path of the run log file, if file-backed
    pub fn run_log_path(&self) -> Option<&Path> {
        self.run_log_path.as_deref()
    }

    /// Write one entry
    pub fn log(&self, severity: Severity, component: &str, message: &str) {
        let entry = LogEntry {
            severity,
            component: component.to_string(),
            message: message.to_string(),
        };
        self.sink
            .lock()
            .expect("RunLogger sink mutex poisoned")
            .write(&entry);
    }

    pub fn info(&self, component: &str, message: &str) {
        self.log(Severity::Info, component, message);
    }

    pub fn success(&self, component: &str, message: &str) {
        self.log(Severity::Success, component, message);
    }

    pub fn warning(&self, component: &str, message: &str) {
        self.log(Severity::Warning, component, message);
    }

    pub fn error(&self, component: &str, message: &str) {
        self.log(Severity::Error, component, message);
    }

    /// Write the structured end-of-run summary.
    pub fn finish(&self, summary: &RunSummary) {
        let divider = "=".repeat(60);
        self.info("summary", &divider);
        let severity = if summary.succeeded {
            Severity::Success
        } else {
            Severity::Error
        };
        self.log(
            severity,
            "summary",
            &format!("status: {}", summary.status_label),
        );
        for (key, value) in &summary.facts {
            self.info("summary", &format!("{}: {}", key, value));
        }
        if let Some(path) = self.run_log_path() {
            self.info("summary", &format!("full log: {}", path.display()));
        }
        if !summary.succeeded {
            for item in &summary.troubleshooting {
                self.warning("summary", item);
            }
        }
        self.info("summary", &divider);
    }
}

/// Remove run logs whose filename stamp is older than the retention window.
///
/// Only files matching `deploy-<stamp>.log` with a parseable stamp are
/// candidates; the stable per-service logs are never touched.
fn prune_run_logs(log_dir: &Path, retention_days: u64) -> Result<usize> {
    let cutoff = Utc::now().naive_utc() - chrono::Duration::days(retention_days as i64);
    let mut removed = 0;

    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        let Some(stamp) = name
            .strip_prefix(RUN_LOG_PREFIX)
            .and_then(|rest| rest.strip_suffix(RUN_LOG_SUFFIX))
        else {
            continue;
        };
        let Ok(stamp) = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) else {
            continue;
        };

        if stamp < cutoff {
            if let Err(e) = fs::remove_file(entry.path()) {
                tracing::warn!("Failed to prune old run log {:?}: {}", entry.path(), e);
            } else {
                removed += 1;
            }
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Info.to_string(), "INFO");
        assert_eq!(Severity::Success.to_string(), "SUCCESS");
        assert_eq!(Severity::Warning.to_string(), "WARNING");
        assert_eq!(Severity::Error.to_string(), "ERROR");
    }

    #[test]
    fn test_memory_sink_captures_entries() {
        let (logger, entries) = RunLogger::memory();
        logger.info("validator", "memory check passed");
        logger.error("executor", "task failed");

        let entries = entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].severity, Severity::Info);
        assert_eq!(entries[0].component, "validator");
        assert_eq!(entries[1].severity, Severity::Error);
        assert_eq!(entries[1].message, "task failed");
    }

    #[test]
    fn test_open_creates_run_log_and_service_logs() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), 14).unwrap();

        let run_log = logger.run_log_path().unwrap();
        assert!(run_log.exists());
        assert!(run_log
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("deploy-"));

        for name in STACK_SERVICE_LOGS {
            assert!(dir.path().join(name).exists(), "{} should exist", name);
        }
    }

    #[test]
    fn test_file_sink_appends_to_run_log() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RunLogger::open(dir.path(), 14).unwrap();
        logger.info("backup", "archive created");

        let content = fs::read_to_string(logger.run_log_path().unwrap()).unwrap();
        assert!(content.contains("[INFO]"));
        assert!(content.contains("[backup]"));
        assert!(content.contains("archive created"));
    }

    #[test]
    fn test_prune_removes_only_stale_run_logs() {
        let dir = tempfile::tempdir().unwrap();
        // Stamp well past any retention window
        fs::write(dir.path().join("deploy-20200101_000000.log"), "old").unwrap();
        // Unparseable stamp is left alone
        fs::write(dir.path().join("deploy-notastamp.log"), "keep").unwrap();
        // Service logs are never pruned
        fs::write(dir.path().join("postfix.log"), "keep").unwrap();

        let removed = prune_run_logs(dir.path(), 14).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("deploy-20200101_000000.log").exists());
        assert!(dir.path().join("deploy-notastamp.log").exists());
        assert!(dir.path().join("postfix.log").exists());
    }

    #[test]
    fn test_finish_writes_summary_with_facts() {
        let (logger, entries) = RunLogger::memory();
        logger.finish(&RunSummary {
            status_label: "success".to_string(),
            succeeded: true,
            facts: vec![("domain".to_string(), "example.com".to_string())],
            troubleshooting: vec![],
        });

        let entries = entries.lock().unwrap();
        assert!(entries
            .iter()
            .any(|e| e.severity == Severity::Success && e.message == "status: success"));
        assert!(entries.iter().any(|e| e.message == "domain: example.com"));
    }

    #[test]
    fn test_finish_includes_troubleshooting_on_failure() {
        let (logger, entries) = RunLogger::memory();
        logger.finish(&RunSummary {
            status_label: "rollback_failed".to_string(),
            succeeded: false,
            facts: vec![],
            troubleshooting: vec!["restore manually from the latest archive".to_string()],
        });

        let entries = entries.lock().unwrap();
        assert!(entries
            .iter()
            .any(|e| e.severity == Severity::Warning
                && e.message.contains("restore manually")));
    }
}
