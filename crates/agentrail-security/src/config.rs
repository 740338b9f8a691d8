use agentrail_core::{AgentrailError, AgentrailResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Agents of the standard research → plan → implement → validate pipeline.
pub const DEFAULT_AGENTS: &[&str] = &[
    "researcher",
    "planner",
    "test-master",
    "implementer",
    "reviewer",
    "security-auditor",
    "doc-master",
];

const DEFAULT_MAX_IDENTIFIER_LEN: usize = 255;
const DEFAULT_MAX_MESSAGE_BYTES: usize = 10_000;

/// Selects how strictly inputs and paths are checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    /// Agent allow-list enforced, only configured roots accepted.
    #[default]
    Production,
    /// Allow-list membership skipped and the temp root accepted. Character,
    /// length, traversal and system-directory rules still apply.
    Relaxed,
}

impl ValidationMode {
    /// Whether this is [`ValidationMode::Relaxed`].
    pub fn is_relaxed(self) -> bool {
        self == ValidationMode::Relaxed
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Production => write!(f, "production"),
            ValidationMode::Relaxed => write!(f, "relaxed"),
        }
    }
}

/// Immutable validation settings, built once per store.
///
/// Nothing here is read from the process environment: callers decide the
/// mode and roots and pass them in through [`ValidationConfig::builder`].
#[derive(Debug, Clone)]
pub struct ValidationConfig {
    mode: ValidationMode,
    allowed_agents: BTreeSet<String>,
    project_root: PathBuf,
    session_dir: PathBuf,
    config_dir: Option<PathBuf>,
    temp_root: Option<PathBuf>,
    max_identifier_len: usize,
    max_message_bytes: usize,
}

impl ValidationConfig {
    /// Starts a builder rooted at `project_root`. The session directory
    /// defaults to `<project_root>/sessions`.
    pub fn builder(project_root: impl Into<PathBuf>) -> ValidationConfigBuilder {
        ValidationConfigBuilder::new(project_root.into())
    }

    pub fn mode(&self) -> ValidationMode {
        self.mode
    }

    pub fn allowed_agents(&self) -> &BTreeSet<String> {
        &self.allowed_agents
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    pub fn temp_root(&self) -> Option<&Path> {
        self.temp_root.as_deref()
    }

    pub fn max_identifier_len(&self) -> usize {
        self.max_identifier_len
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Roots a validated path may live under. The temp root only counts in
    /// relaxed mode.
    pub fn allowed_roots(&self) -> Vec<&Path> {
        let mut roots = vec![self.project_root.as_path(), self.session_dir.as_path()];
        if let Some(dir) = &self.config_dir {
            roots.push(dir);
        }
        if self.mode.is_relaxed() {
            if let Some(tmp) = &self.temp_root {
                roots.push(tmp);
            }
        }
        roots
    }
}

/// Builder for [`ValidationConfig`].
#[derive(Debug, Clone)]
pub struct ValidationConfigBuilder {
    mode: ValidationMode,
    allowed_agents: BTreeSet<String>,
    project_root: PathBuf,
    session_dir: Option<PathBuf>,
    config_dir: Option<PathBuf>,
    temp_root: Option<PathBuf>,
    max_identifier_len: usize,
    max_message_bytes: usize,
}

impl ValidationConfigBuilder {
    fn new(project_root: PathBuf) -> Self {
        Self {
            mode: ValidationMode::Production,
            allowed_agents: DEFAULT_AGENTS.iter().map(|a| (*a).to_string()).collect(),
            project_root,
            session_dir: None,
            config_dir: None,
            temp_root: None,
            max_identifier_len: DEFAULT_MAX_IDENTIFIER_LEN,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    pub fn mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replaces the agent allow-list. An empty list disables membership checks.
    pub fn allowed_agents<I, S>(mut self, agents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_agents = agents.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = Some(dir.into());
        self
    }

    pub fn config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Process-temporary root accepted in relaxed mode only.
    pub fn temp_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(dir.into());
        self
    }

    pub fn max_message_bytes(mut self, max: usize) -> Self {
        self.max_message_bytes = max;
        self
    }

    pub fn max_identifier_len(mut self, max: usize) -> Self {
        self.max_identifier_len = max;
        self
    }

    /// Validates the settings. Every root must be absolute; relative session or
    /// config directories are taken relative to the project root.
    pub fn build(self) -> AgentrailResult<ValidationConfig> {
        if !self.project_root.is_absolute() {
            return Err(AgentrailError::Config(format!(
                "project root must be absolute, got '{}'",
                self.project_root.display()
            )));
        }
        if self.max_identifier_len == 0 || self.max_message_bytes == 0 {
            return Err(AgentrailError::Config(
                "size limits must be greater than zero".to_string(),
            ));
        }

        let anchor = |dir: PathBuf| {
            if dir.is_absolute() {
                dir
            } else {
                self.project_root.join(dir)
            }
        };
        let session_dir = anchor(
            self.session_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("sessions")),
        );
        let config_dir = self.config_dir.clone().map(anchor);

        if let Some(tmp) = &self.temp_root {
            if !tmp.is_absolute() {
                return Err(AgentrailError::Config(format!(
                    "temp root must be absolute, got '{}'",
                    tmp.display()
                )));
            }
        }

        Ok(ValidationConfig {
            mode: self.mode,
            allowed_agents: self.allowed_agents,
            project_root: self.project_root,
            session_dir,
            config_dir,
            temp_root: self.temp_root,
            max_identifier_len: self.max_identifier_len,
            max_message_bytes: self.max_message_bytes,
        })
    }
}
