//! `agentrail.toml` loading.

use agentrail_security::audit::{DEFAULT_MAX_BYTES, DEFAULT_MAX_GENERATIONS};
use agentrail_security::{
    AuditLogger, PathValidator, ValidationConfig, ValidationMode, DEFAULT_AGENTS,
};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "agentrail.toml";

#[derive(Debug, Default, Deserialize)]
pub struct AgentrailConfig {
    #[serde(default)]
    pub validation: ValidationSection,
    #[serde(default)]
    pub audit: AuditSection,
}

#[derive(Debug, Deserialize)]
pub struct ValidationSection {
    #[serde(default)]
    pub mode: ValidationMode,
    /// Relative to the directory holding the config file.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Relative paths are taken from the project root.
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
    #[serde(default)]
    pub config_dir: Option<PathBuf>,
    #[serde(default = "default_allowed_agents")]
    pub allowed_agents: Vec<String>,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            mode: ValidationMode::default(),
            project_root: default_project_root(),
            session_dir: default_session_dir(),
            config_dir: None,
            allowed_agents: default_allowed_agents(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuditSection {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,
    /// Relative paths are taken from the project root.
    #[serde(default = "default_audit_path")]
    pub path: PathBuf,
    #[serde(default = "default_audit_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_audit_generations")]
    pub max_generations: usize,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            path: default_audit_path(),
            max_bytes: default_audit_max_bytes(),
            max_generations: default_audit_generations(),
        }
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_session_dir() -> PathBuf {
    PathBuf::from("docs/sessions")
}
fn default_allowed_agents() -> Vec<String> {
    DEFAULT_AGENTS.iter().map(|a| (*a).to_string()).collect()
}
fn default_max_message_bytes() -> usize {
    10_000
}
fn default_audit_enabled() -> bool {
    true
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("logs/security_audit.jsonl")
}
fn default_audit_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}
fn default_audit_generations() -> usize {
    DEFAULT_MAX_GENERATIONS
}

impl AgentrailConfig {
    /// Reads the config file. Without an explicit path, a missing
    /// `agentrail.toml` falls back to defaults. Returns the config and the
    /// directory relative paths in it are resolved from.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<(Self, PathBuf)> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    debug!("No {DEFAULT_CONFIG_FILE} found, using defaults");
                    return Ok((Self::default(), std::env::current_dir()?));
                }
                default
            }
        };

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        let config = Self::parse(&config_str)
            .with_context(|| format!("Invalid config file '{}'", path.display()))?;

        let base = std::env::current_dir()?.join(path.parent().unwrap_or_else(|| Path::new(".")));
        info!(path = %path.display(), "Loaded config");
        Ok((config, base))
    }

    pub fn parse(config_str: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    /// Builds the validation settings. `relaxed` forces relaxed mode, which
    /// also admits the process temp directory.
    pub fn validation_config(
        &self,
        base: &Path,
        relaxed: bool,
    ) -> anyhow::Result<ValidationConfig> {
        let v = &self.validation;
        let root = base.join(&v.project_root);
        let root = std::fs::canonicalize(&root)
            .with_context(|| format!("Project root '{}' is not accessible", root.display()))?;

        let mode = if relaxed { ValidationMode::Relaxed } else { v.mode };
        let mut builder = ValidationConfig::builder(root)
            .mode(mode)
            .allowed_agents(v.allowed_agents.iter().cloned())
            .session_dir(&v.session_dir)
            .max_message_bytes(v.max_message_bytes);
        if let Some(dir) = &v.config_dir {
            builder = builder.config_dir(dir);
        }
        if mode.is_relaxed() {
            builder = builder.temp_root(std::env::temp_dir());
        }
        Ok(builder.build()?)
    }

    /// Opens the audit log after checking its path like any other file.
    pub fn audit_logger(&self, validation: &Arc<ValidationConfig>) -> anyhow::Result<AuditLogger> {
        let a = &self.audit;
        if !a.enabled {
            return Ok(AuditLogger::disabled());
        }
        let paths = PathValidator::new(validation.clone(), Arc::new(AuditLogger::disabled()));
        let path = paths.validate(&a.path, "audit log", true)?;
        Ok(AuditLogger::with_rotation(
            path.into_path_buf(),
            a.max_bytes,
            a.max_generations,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AgentrailConfig::parse("").unwrap();
        assert_eq!(config.validation.mode, ValidationMode::Production);
        assert_eq!(config.validation.session_dir, PathBuf::from("docs/sessions"));
        assert_eq!(config.validation.allowed_agents.len(), DEFAULT_AGENTS.len());
        assert_eq!(config.validation.max_message_bytes, 10_000);
        assert!(config.audit.enabled);
        assert_eq!(config.audit.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.audit.max_generations, 5);
    }

    #[test]
    fn test_full_config() {
        let config = AgentrailConfig::parse(
            r#"
            [validation]
            mode = "relaxed"
            project_root = "workspace"
            session_dir = "state"
            config_dir = ".agentrail"
            allowed_agents = ["alpha", "beta"]
            max_message_bytes = 2048

            [audit]
            path = "audit/trail.jsonl"
            max_bytes = 4096
            max_generations = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.validation.mode, ValidationMode::Relaxed);
        assert_eq!(config.validation.allowed_agents, vec!["alpha", "beta"]);
        assert_eq!(config.validation.config_dir, Some(PathBuf::from(".agentrail")));
        assert_eq!(config.audit.max_generations, 2);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(AgentrailConfig::parse("[validation]\nmode = \"lenient\"").is_err());
    }

    #[test]
    fn test_validation_config_resolves_relative_root() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("workspace")).unwrap();
        let config =
            AgentrailConfig::parse("[validation]\nproject_root = \"workspace\"").unwrap();

        let validation = config.validation_config(tmp.path(), false).unwrap();
        let root = std::fs::canonicalize(tmp.path().join("workspace")).unwrap();
        assert_eq!(validation.project_root(), root.as_path());
        assert_eq!(validation.session_dir(), root.join("docs/sessions").as_path());
        assert_eq!(validation.mode(), ValidationMode::Production);
        assert!(validation.temp_root().is_none());
    }

    #[test]
    fn test_relaxed_flag_overrides_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentrailConfig::default();
        let validation = config.validation_config(tmp.path(), true).unwrap();
        assert_eq!(validation.mode(), ValidationMode::Relaxed);
        assert!(validation.temp_root().is_some());
    }

    #[test]
    fn test_missing_project_root_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentrailConfig::parse("[validation]\nproject_root = \"nowhere\"").unwrap();
        assert!(config.validation_config(tmp.path(), false).is_err());
    }

    #[test]
    fn test_audit_path_is_validated() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentrailConfig::parse("[audit]\npath = \"../outside.jsonl\"").unwrap();
        let validation = Arc::new(config.validation_config(tmp.path(), false).unwrap());
        assert!(config.audit_logger(&validation).is_err());

        let config = AgentrailConfig::default();
        let audit = config.audit_logger(&validation).unwrap();
        assert!(audit.path().unwrap().ends_with("logs/security_audit.jsonl"));
    }

    #[test]
    fn test_disabled_audit() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AgentrailConfig::parse("[audit]\nenabled = false").unwrap();
        let validation = Arc::new(config.validation_config(tmp.path(), false).unwrap());
        assert!(config.audit_logger(&validation).unwrap().path().is_none());
    }
}
