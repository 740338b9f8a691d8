use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Values longer than this are shortened before they are echoed back.
const REDACT_THRESHOLD: usize = 128;
const REDACT_KEEP: usize = 64;

/// A convenience `Result` alias using [`AgentrailError`].
pub type AgentrailResult<T> = Result<T, AgentrailError>;

/// Top-level error type for agentrail.
#[derive(Error, Debug)]
pub enum AgentrailError {
    /// A path failed one of the path validator's layers.
    #[error("Path security error: {0}")]
    PathSecurity(#[from] PathSecurityError),

    /// An identifier, message or reference was malformed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// `start` was called while the latest attempt for the agent is still running.
    #[error("Agent '{agent}' is already running (attempt {attempt}); complete or fail it before starting again")]
    DuplicateStart {
        /// Agent name.
        agent: String,
        /// The attempt that is still running.
        attempt: u32,
    },

    /// `complete`/`fail` was called for an agent that was never started.
    #[error("No execution recorded for agent '{agent}'; call start first")]
    UnknownExecution {
        /// Agent name.
        agent: String,
    },

    /// The requested transition is not allowed by the execution state machine.
    #[error("Agent '{agent}' attempt {attempt} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Agent name.
        agent: String,
        /// Attempt number of the latest execution.
        attempt: u32,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The agent has used up every attempt number.
    #[error("Agent '{agent}' has no attempt numbers left after attempt {attempt}")]
    AttemptsExhausted {
        /// Agent name.
        agent: String,
        /// The latest recorded attempt.
        attempt: u32,
    },

    /// The persisted session document could not be parsed.
    #[error("Session file '{}' is corrupt: {source}", path.display())]
    SessionCorruption {
        /// The file that failed to parse.
        path: PathBuf,
        /// Underlying parser error.
        #[source]
        source: serde_json::Error,
    },

    /// An I/O failure during the atomic write. The destination is unchanged.
    #[error("Failed to persist session to '{}': {source}", path.display())]
    Persistence {
        /// Destination of the write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The session file was replaced by another writer since it was last read.
    #[error("Session file '{}' changed on disk: expected version {expected}, found {found}", path.display())]
    VersionConflict {
        /// The contested file.
        path: PathBuf,
        /// Version this store last loaded or wrote.
        expected: u64,
        /// Version currently on disk.
        found: u64,
    },

    /// Invalid configuration supplied by the caller.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error outside the atomic write path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentrailError {
    /// Short machine-readable kind, used as the `error` field of audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentrailError::PathSecurity(_) => "path_security",
            AgentrailError::Validation(_) => "validation",
            AgentrailError::DuplicateStart { .. } => "duplicate_start",
            AgentrailError::UnknownExecution { .. } => "unknown_execution",
            AgentrailError::InvalidTransition { .. } => "invalid_transition",
            AgentrailError::AttemptsExhausted { .. } => "attempts_exhausted",
            AgentrailError::SessionCorruption { .. } => "session_corruption",
            AgentrailError::Persistence { .. } => "persistence",
            AgentrailError::VersionConflict { .. } => "version_conflict",
            AgentrailError::Config(_) => "config",
            AgentrailError::Json(_) => "json",
            AgentrailError::Io(_) => "io",
        }
    }
}

// --- Path security ---

/// Why a path was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathRejection {
    /// The textual path contains a `..` segment.
    Traversal,
    /// The path itself is a symbolic link.
    Symlink,
    /// The path does not exist and the caller did not allow missing paths.
    Missing,
    /// The path (or its nearest existing ancestor) could not be resolved.
    Unresolvable(String),
    /// The canonical path is not below any allowed root.
    OutsideAllowedRoots {
        /// The resolved form that was checked.
        canonical: String,
    },
    /// The path names a system directory.
    SystemDirectory {
        /// The matched marker, e.g. `/etc/`.
        marker: &'static str,
    },
}

impl PathRejection {
    /// Remediation hint shown to the caller.
    pub fn hint(&self) -> &'static str {
        match self {
            PathRejection::Traversal => "use a path without '..' segments",
            PathRejection::Symlink => "point at the real file instead of a symbolic link",
            PathRejection::Missing => "create the file first or pass a path that exists",
            PathRejection::Unresolvable(_) => {
                "check that the parent directory exists and is readable"
            }
            PathRejection::OutsideAllowedRoots { .. } => {
                "keep files under the project root, session directory or config directory"
            }
            PathRejection::SystemDirectory { .. } => {
                "system directories are never writable by agentrail"
            }
        }
    }
}

impl fmt::Display for PathRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathRejection::Traversal => write!(f, "path traversal ('..') is not allowed"),
            PathRejection::Symlink => write!(f, "symbolic links are not allowed"),
            PathRejection::Missing => write!(f, "path does not exist"),
            PathRejection::Unresolvable(reason) => write!(f, "cannot resolve path: {reason}"),
            PathRejection::OutsideAllowedRoots { canonical } => {
                write!(f, "'{canonical}' is outside the allowed directories")
            }
            PathRejection::SystemDirectory { marker } => {
                write!(f, "system directory '{marker}' is blocked")
            }
        }
    }
}

/// A path rejected by the path validator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{purpose} path '{path}' rejected: {reason} (hint: {})", reason.hint())]
pub struct PathSecurityError {
    /// The path as supplied by the caller (redacted if oversized).
    pub path: String,
    /// What the path was going to be used for, e.g. "session file".
    pub purpose: String,
    /// The failing layer.
    pub reason: PathRejection,
}

impl PathSecurityError {
    /// Creates a new error, redacting oversized paths.
    pub fn new(path: &str, purpose: impl Into<String>, reason: PathRejection) -> Self {
        Self {
            path: redact(path),
            purpose: purpose.into(),
            reason,
        }
    }
}

// --- Input validation ---

/// A malformed externally supplied value.
///
/// Carries enough context for the caller to fix the input without reading
/// source: the field, the expected shape, what was received and a hint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid {field}: expected {expected}, received {received} (hint: {hint})")]
pub struct ValidationError {
    /// Which input failed, e.g. "agent name".
    pub field: String,
    /// Expected shape.
    pub expected: String,
    /// The received value, redacted if oversized.
    pub received: String,
    /// Remediation hint.
    pub hint: String,
}

impl ValidationError {
    /// Creates a new error. `received` is redacted and control characters are escaped.
    pub fn new(
        field: impl Into<String>,
        expected: impl Into<String>,
        received: &str,
        hint: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
            received: redact(received),
            hint: hint.into(),
        }
    }
}

/// Shortens oversized values and escapes control characters so the value
/// can be echoed into logs safely.
pub fn redact(value: &str) -> String {
    let escaped = |s: &str| -> String {
        s.chars()
            .flat_map(|c| {
                if c.is_control() {
                    c.escape_default().collect::<Vec<_>>()
                } else {
                    vec![c]
                }
            })
            .collect()
    };

    if value.len() <= REDACT_THRESHOLD {
        return format!("'{}'", escaped(value));
    }

    let prefix: String = value.chars().take(REDACT_KEEP).collect();
    format!("'{}...' ({} bytes)", escaped(&prefix), value.len())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_short_value_is_quoted() {
        assert_eq!(redact("researcher"), "'researcher'");
    }

    #[test]
    fn test_redact_long_value_is_truncated() {
        let long = "x".repeat(10_001);
        let out = redact(&long);
        assert!(out.contains("(10001 bytes)"));
        assert!(out.len() < 100);
    }

    #[test]
    fn test_redact_escapes_control_characters() {
        let out = redact("evil\x1b[31m");
        assert!(!out.contains('\x1b'));
        assert!(out.contains("\\u{1b}"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new(
            "agent name",
            "1-255 characters of [A-Za-z0-9_-]",
            "a;b",
            "remove punctuation",
        );
        let msg = err.to_string();
        assert!(msg.contains("agent name"));
        assert!(msg.contains("'a;b'"));
        assert!(msg.contains("remove punctuation"));
    }

    #[test]
    fn test_path_error_display_includes_hint() {
        let err =
            PathSecurityError::new("../../etc/passwd", "session file", PathRejection::Traversal);
        let msg = err.to_string();
        assert!(msg.contains("session file"));
        assert!(msg.contains("traversal"));
        assert!(msg.contains("hint"));
    }
}
