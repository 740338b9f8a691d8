use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Rotate once the live file would grow past this many bytes.
pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10MB
/// Number of rotated generations kept next to the live file.
pub const DEFAULT_MAX_GENERATIONS: usize = 5;
/// String context values longer than this are truncated.
const MAX_CONTEXT_VALUE_BYTES: usize = 512;

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub outcome: AuditOutcome,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    max_generations: usize,
}

impl FileSink {
    fn append(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let current = match fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };
        if current > 0 && current + line.len() as u64 > self.max_bytes {
            self.rotate()?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    /// `audit.jsonl` → `audit.jsonl.1` → ... → `audit.jsonl.N`; the oldest
    /// generation is dropped.
    fn rotate(&self) -> io::Result<()> {
        if self.max_generations == 0 {
            return remove_if_exists(&self.path);
        }

        remove_if_exists(&self.generation_path(self.max_generations))?;
        for n in (1..self.max_generations).rev() {
            let from = self.generation_path(n);
            if from.exists() {
                fs::rename(&from, self.generation_path(n + 1))?;
            }
        }
        fs::rename(&self.path, self.generation_path(1))
    }

    fn generation_path(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Append-only audit log shared by the validators and the session store.
///
/// Records are JSON lines. Writers are serialized by a mutex so records from
/// concurrent callers never interleave. Logging is best-effort: a failed
/// write is reported through `tracing` and counted, never returned to the
/// caller whose operation is being described.
pub struct AuditLogger {
    sink: Option<Mutex<FileSink>>,
    failed_writes: AtomicU64,
}

impl AuditLogger {
    /// Audit log at `path` with the default rotation policy.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_rotation(path, DEFAULT_MAX_BYTES, DEFAULT_MAX_GENERATIONS)
    }

    /// Audit log that rotates at `max_bytes`, keeping `max_generations` old files.
    pub fn with_rotation(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        max_generations: usize,
    ) -> Self {
        Self {
            sink: Some(Mutex::new(FileSink {
                path: path.into(),
                max_bytes,
                max_generations,
            })),
            failed_writes: AtomicU64::new(0),
        }
    }

    /// A logger that only mirrors records to `tracing`.
    pub fn disabled() -> Self {
        Self {
            sink: None,
            failed_writes: AtomicU64::new(0),
        }
    }

    /// Path of the live log file, if file output is enabled.
    pub fn path(&self) -> Option<PathBuf> {
        self.sink.as_ref().map(|s| s.lock().path.clone())
    }

    /// Number of records that could not be written.
    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::Relaxed)
    }

    pub fn log(&self, entry: AuditEntry) {
        info!(
            event = %entry.event,
            outcome = ?entry.outcome,
            "audit"
        );

        let Some(sink) = &self.sink else {
            return;
        };

        let line = match serde_json::to_string(&entry) {
            Ok(json) => format!("{json}\n"),
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                warn!(event = %entry.event, error = %e, "Failed to serialize audit record");
                return;
            }
        };

        let sink = sink.lock();
        if let Err(e) = sink.append(&line) {
            self.failed_writes.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = %entry.event,
                path = %sink.path.display(),
                error = %e,
                "Failed to write audit record"
            );
        }
    }

    /// Records `event` with `outcome`. A non-object `context` is stored under `value`.
    pub fn log_event(
        &self,
        event: impl Into<String>,
        outcome: AuditOutcome,
        context: serde_json::Value,
    ) {
        let mut context = match context {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        for value in context.values_mut() {
            if let serde_json::Value::String(s) = value {
                truncate_in_place(s);
            }
        }

        self.log(AuditEntry {
            timestamp: Utc::now(),
            event: event.into(),
            outcome,
            context,
        });
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("path", &self.path())
            .field("failed_writes", &self.failed_writes())
            .finish()
    }
}

fn truncate_in_place(s: &mut String) {
    if s.len() <= MAX_CONTEXT_VALUE_BYTES {
        return;
    }
    let mut cut = MAX_CONTEXT_VALUE_BYTES;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    let original = s.len();
    s.truncate(cut);
    s.push_str(&format!("... ({original} bytes)"));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_serialization() {
        let mut context = serde_json::Map::new();
        context.insert("agent".to_string(), serde_json::json!("researcher"));
        let entry = AuditEntry {
            timestamp: Utc::now(),
            event: "agent_start".to_string(),
            outcome: AuditOutcome::Denied,
            context,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"outcome\":\"denied\""));
        assert!(json.contains("\"agent\":\"researcher\""));
    }

    #[test]
    fn test_long_context_values_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let audit = AuditLogger::new(&path);
        audit.log_event(
            "message",
            AuditOutcome::Success,
            serde_json::json!({ "text": "é".repeat(1_000) }),
        );
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("(2000 bytes)"));
        assert!(contents.len() < 1_000);
    }

    #[test]
    fn test_non_object_context_wrapped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("audit.jsonl");
        let audit = AuditLogger::new(&path);
        audit.log_event("ping", AuditOutcome::Success, serde_json::json!(42));
        let contents = fs::read_to_string(&path).unwrap();
        let record: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(record["context"]["value"], 42);
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        let audit = AuditLogger::disabled();
        audit.log_event("noop", AuditOutcome::Success, serde_json::Value::Null);
        assert!(audit.path().is_none());
        assert_eq!(audit.failed_writes(), 0);
    }
}
