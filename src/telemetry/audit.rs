//! # Audit Log
//!
//! Append-only JSON Lines record of schemas, updates and commands.
//!
//! Every record is one line `{"time": <rfc3339>, "kind": <kind>, "payload": <json>}`.
//! Writes go through a `tracing-appender` non-blocking worker so logging
//! never stalls the ingestion or command paths. [`AuditLog::rotate`] closes
//! the current file (flushing its worker) and starts `<name>.jsonl`.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::error::{GatewayError, Result};

/// File extension of audit logs
pub const AUDIT_EXTENSION: &str = "jsonl";

/// Kind of an audit record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditKind {
    /// A schema was installed or a new log was started
    Meta,
    /// A telemetry update was applied
    Update,
    /// An operator command was accepted
    Cmd,
}

#[derive(Serialize)]
struct AuditRecord<'a> {
    time: String,
    kind: AuditKind,
    payload: &'a Value,
}

struct Sink {
    name: String,
    writer: NonBlocking,
    // Dropping the guard flushes and stops the worker thread
    _guard: WorkerGuard,
}

struct AuditState {
    dir: Option<PathBuf>,
    sink: Option<Sink>,
}

/// Handle to the audit log, cheap to clone
#[derive(Clone)]
pub struct AuditLog {
    state: Arc<Mutex<AuditState>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("current", &self.current())
            .finish()
    }
}

impl AuditLog {
    /// An audit log that drops every record.
    pub fn disabled() -> Self {
        Self {
            state: Arc::new(Mutex::new(AuditState { dir: None, sink: None })),
        }
    }

    /// Open `<dir>/<name>.jsonl`, creating the directory if needed.
    pub fn open(dir: impl AsRef<Path>, name: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let sink = open_sink(&dir, name)?;
        info!("Audit log writing to {}", dir.join(file_name(name)).display());

        Ok(Self {
            state: Arc::new(Mutex::new(AuditState {
                dir: Some(dir),
                sink: Some(sink),
            })),
        })
    }

    /// Close the current file and continue in `<name>.jsonl`.
    ///
    /// A disabled log stays disabled.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvalidCommand`] if `name` is empty or contains a path
    /// separator, [`GatewayError::Io`] if the file cannot be created.
    pub fn rotate(&self, name: &str) -> Result<()> {
        self.rotate_inner(name, None)
    }

    /// [`AuditLog::rotate`], writing `payload` as the first record of the
    /// new file before any other record can land there.
    pub fn rotate_with(&self, name: &str, kind: AuditKind, payload: &Value) -> Result<()> {
        self.rotate_inner(name, Some((kind, payload)))
    }

    fn rotate_inner(&self, name: &str, first: Option<(AuditKind, &Value)>) -> Result<()> {
        validate_name(name)?;

        let mut state = self.lock();
        let Some(dir) = state.dir.clone() else {
            debug!("Audit log disabled, ignoring rotation to {}", name);
            return Ok(());
        };

        let mut sink = open_sink(&dir, name)?;
        if let Some((kind, payload)) = first {
            write_record(&mut sink, kind, payload);
        }
        if let Some(previous) = state.sink.replace(sink) {
            info!("Audit log rotated from {} to {}", previous.name, name);
        }
        Ok(())
    }

    /// Append one record. Failures are logged and otherwise ignored.
    pub fn log(&self, kind: AuditKind, payload: &Value) {
        let mut state = self.lock();
        if let Some(sink) = state.sink.as_mut() {
            write_record(sink, kind, payload);
        }
    }

    /// Name of the file currently written, without extension.
    pub fn current(&self) -> Option<String> {
        self.lock().sink.as_ref().map(|sink| sink.name.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().dir.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn write_record(sink: &mut Sink, kind: AuditKind, payload: &Value) {
    let record = AuditRecord {
        time: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        kind,
        payload,
    };

    let result = serde_json::to_vec(&record).map_err(io::Error::from).and_then(|mut line| {
        line.push(b'\n');
        sink.writer.write_all(&line)
    });
    if let Err(e) = result {
        warn!("Failed to write {:?} audit record: {}", kind, e);
    }
}

fn file_name(name: &str) -> String {
    format!("{}.{}", name, AUDIT_EXTENSION)
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(GatewayError::InvalidCommand(format!("invalid log name {:?}", name)));
    }
    Ok(())
}

fn open_sink(dir: &Path, name: &str) -> Result<Sink> {
    validate_name(name)?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .filename_suffix(AUDIT_EXTENSION)
        .build(dir)
        .map_err(|e| GatewayError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    let (writer, guard) = tracing_appender::non_blocking(appender);
    Ok(Sink {
        name: name.to_string(),
        writer,
        _guard: guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn read_records(dir: &Path, name: &str) -> Vec<Value> {
        std::fs::read_to_string(dir.join(file_name(name)))
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn test_records_are_json_lines() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path(), "init").unwrap();

        audit.log(AuditKind::Meta, &json!({"alpha": {"valu": 0, "desc": "a"}}));
        audit.log(AuditKind::Update, &json!({"alpha": 7}));
        audit.log(AuditKind::Cmd, &json!({"cmd": {"slate.valve": 1}}));
        drop(audit);

        let records = read_records(dir.path(), "init");
        assert_eq!(records.len(), 3);
        assert_eq!(records[0]["kind"], "meta");
        assert_eq!(records[1]["kind"], "update");
        assert_eq!(records[1]["payload"], json!({"alpha": 7}));
        assert_eq!(records[2]["kind"], "cmd");

        let time = records[0]["time"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(time).is_ok());
    }

    #[test]
    fn test_rotate_starts_new_file() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path(), "init").unwrap();

        audit.log(AuditKind::Update, &json!({"a": 1}));
        audit.rotate("burn-1").unwrap();
        audit.log(AuditKind::Update, &json!({"a": 2}));
        assert_eq!(audit.current().as_deref(), Some("burn-1"));
        drop(audit);

        assert_eq!(read_records(dir.path(), "init").len(), 1);
        let records = read_records(dir.path(), "burn-1");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["payload"], json!({"a": 2}));
    }

    #[test]
    fn test_rotate_with_writes_header_first() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path(), "init").unwrap();

        audit
            .rotate_with("burn-2", AuditKind::Meta, &json!({"alpha": {"valu": 0}}))
            .unwrap();
        audit.log(AuditKind::Update, &json!({"alpha": 1}));
        drop(audit);

        let records = read_records(dir.path(), "burn-2");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["kind"], "meta");
        assert_eq!(records[0]["payload"], json!({"alpha": {"valu": 0}}));
        assert_eq!(records[1]["kind"], "update");
    }

    #[test]
    fn test_clones_share_the_file() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path(), "init").unwrap();
        let other = audit.clone();

        other.rotate("second").unwrap();
        assert_eq!(audit.current().as_deref(), Some("second"));
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = TempDir::new().unwrap();
        let audit = AuditLog::open(dir.path(), "init").unwrap();

        for name in ["", "../escape", "a/b", "..", "a\\b"] {
            assert!(
                matches!(audit.rotate(name), Err(GatewayError::InvalidCommand(_))),
                "{:?} accepted",
                name
            );
        }
        assert_eq!(audit.current().as_deref(), Some("init"));
    }

    #[test]
    fn test_disabled_log_ignores_everything() {
        let audit = AuditLog::disabled();
        audit.log(AuditKind::Meta, &json!({}));
        audit.rotate("anything").unwrap();

        assert!(!audit.is_enabled());
        assert_eq!(audit.current(), None);
    }
}
