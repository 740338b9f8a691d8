use crate::atomic;
use crate::session::{
    AgentExecution, ExecutionStatus, PipelineProgress, Session, SessionStatus, SessionSummary,
    Transition,
};
use agentrail_core::{AgentrailError, AgentrailResult};
use agentrail_security::{
    AuditLogger, AuditOutcome, CanonicalPath, InputValidator, PathValidator, ValidationConfig,
};
use chrono::Utc;
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SESSION_FILE_SUFFIX: &str = "-pipeline.json";
const SESSION_PURPOSE: &str = "session file";

/// How `persist` treats a file that another process replaced meanwhile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Overwrite unconditionally; the last writer wins.
    #[default]
    LastWriterWins,
    /// Refuse to overwrite when the on-disk version differs from the one
    /// this store last loaded or wrote.
    Optimistic,
}

#[derive(Deserialize)]
struct VersionStamp {
    #[serde(default)]
    version: u64,
}

/// Session state for one pipeline run, backed by a single JSON file.
///
/// Every mutating operation validates its inputs, applies the change to a
/// copy of the session, writes that copy atomically and only then swaps it
/// in. A failed write therefore leaves memory and disk on the previous
/// snapshot.
///
/// Several processes may each hold a store for the same file. Writes are
/// last-writer-wins unless [`ConcurrencyPolicy::Optimistic`] is selected.
pub struct SessionStore {
    path: CanonicalPath,
    session: Session,
    paths: PathValidator,
    inputs: InputValidator,
    audit: Arc<AuditLogger>,
    policy: ConcurrencyPolicy,
}

impl SessionStore {
    /// Starts a new session in the configured session directory and writes it.
    pub fn create(
        config: Arc<ValidationConfig>,
        audit: Arc<AuditLogger>,
    ) -> AgentrailResult<Self> {
        let session = Session::new();
        let file_name = format!(
            "{}-{}{SESSION_FILE_SUFFIX}",
            session.created_at.format("%Y%m%d-%H%M%S"),
            &session.id.simple().to_string()[..8]
        );
        let path = config.session_dir().join(file_name);
        Self::create_with(config, audit, path, session)
    }

    /// Starts a new session stored at `path`. Fails if the file already exists.
    pub fn create_at(
        config: Arc<ValidationConfig>,
        audit: Arc<AuditLogger>,
        path: impl AsRef<Path>,
    ) -> AgentrailResult<Self> {
        Self::create_with(config, audit, path.as_ref().to_path_buf(), Session::new())
    }

    fn create_with(
        config: Arc<ValidationConfig>,
        audit: Arc<AuditLogger>,
        path: PathBuf,
        session: Session,
    ) -> AgentrailResult<Self> {
        let paths = PathValidator::new(config.clone(), audit.clone());
        let inputs = InputValidator::new(config, audit.clone());
        let path = paths.validate(&path, SESSION_PURPOSE, true)?;
        if path.as_path().exists() {
            return Err(AgentrailError::Persistence {
                path: path.into_path_buf(),
                source: io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "session file already exists; open it instead",
                ),
            });
        }
        if let Some(parent) = path.as_path().parent() {
            fs::create_dir_all(parent).map_err(|source| AgentrailError::Persistence {
                path: path.as_path().to_path_buf(),
                source,
            })?;
        }

        let mut store = Self {
            path,
            session: session.clone(),
            paths,
            inputs,
            audit,
            policy: ConcurrencyPolicy::default(),
        };
        store.write(session)?;
        info!(session_id = %store.session.id, path = %store.path, "Session created");
        store.audit.log_event(
            "session_create",
            AuditOutcome::Success,
            serde_json::json!({
                "session_id": store.session.id.to_string(),
                "path": store.path.to_string(),
            }),
        );
        Ok(store)
    }

    /// Opens an existing session file.
    pub fn open(
        config: Arc<ValidationConfig>,
        audit: Arc<AuditLogger>,
        path: impl AsRef<Path>,
    ) -> AgentrailResult<Self> {
        let paths = PathValidator::new(config.clone(), audit.clone());
        let inputs = InputValidator::new(config, audit.clone());
        let path = paths.validate(path.as_ref(), SESSION_PURPOSE, false)?;
        let session = read_document(&path, &audit)?;
        debug!(session_id = %session.id, path = %path, version = session.version, "Session opened");
        Ok(Self {
            path,
            session,
            paths,
            inputs,
            audit,
            policy: ConcurrencyPolicy::default(),
        })
    }

    /// Selects how [`persist`](Self::persist) handles concurrent writers.
    pub fn with_concurrency_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    // --- State operations ---

    /// Marks `agent` as running. Fails with `DuplicateStart` if its latest
    /// attempt is still running; a pending attempt is promoted, otherwise a
    /// new attempt is opened. Returns the attempt number.
    pub fn start(
        &mut self,
        agent: &str,
        message: &str,
        tools: Vec<String>,
    ) -> AgentrailResult<u32> {
        let result = self.validate_agent_and_message(agent, message).and_then(|()| {
            self.apply(|session| session.begin(agent, message, tools, Utc::now()))
        });
        self.record("agent_start", agent, &result, |attempt| {
            serde_json::json!({ "attempt": attempt })
        });
        result
    }

    /// Queues a pending attempt for `agent`. Returns `None` if one is
    /// already pending.
    pub fn enqueue(&mut self, agent: &str, message: &str) -> AgentrailResult<Option<u32>> {
        let result = self
            .validate_agent_and_message(agent, message)
            .and_then(|()| {
                let mut next = self.session.clone();
                match next.enqueue(agent, message, Utc::now())? {
                    Some(attempt) => {
                        self.write(next)?;
                        Ok(Some(attempt))
                    }
                    None => Ok(None),
                }
            });
        self.record("agent_enqueue", agent, &result, |attempt| {
            serde_json::json!({ "attempt": attempt })
        });
        result
    }

    /// Marks the running attempt of `agent` completed. Repeating the call
    /// after it already completed succeeds without changing anything.
    pub fn complete(
        &mut self,
        agent: &str,
        message: &str,
        reference: Option<i64>,
    ) -> AgentrailResult<Transition> {
        let result = self.finish(agent, ExecutionStatus::Completed, message, reference);
        self.record("agent_complete", agent, &result, transition_context);
        result
    }

    /// Marks the running attempt of `agent` failed. Repeating the call after
    /// it already failed succeeds without changing anything.
    pub fn fail(&mut self, agent: &str, message: &str) -> AgentrailResult<Transition> {
        let result = self.finish(agent, ExecutionStatus::Failed, message, None);
        self.record("agent_fail", agent, &result, transition_context);
        result
    }

    /// Whether at least two of `agents` ran concurrently (see
    /// [`Session::verify_overlap`]).
    pub fn verify_overlap<S: AsRef<str>>(&self, agents: &[S]) -> AgentrailResult<bool> {
        for agent in agents {
            self.inputs.validate_identifier(agent.as_ref())?;
        }
        let overlapped = self.session.verify_overlap(agents, Utc::now());
        let names: Vec<&str> = agents.iter().map(AsRef::as_ref).collect();
        self.audit.log_event(
            "overlap_check",
            AuditOutcome::Success,
            serde_json::json!({
                "session_id": self.session.id.to_string(),
                "agents": names,
                "overlapped": overlapped,
            }),
        );
        Ok(overlapped)
    }

    // --- Persistence ---

    /// Writes the current session atomically, bumping its version.
    pub fn persist(&mut self) -> AgentrailResult<()> {
        let snapshot = self.session.clone();
        self.write(snapshot)
    }

    /// Like [`persist`](Self::persist) but always applies the optimistic
    /// version check, whatever the configured policy.
    pub fn persist_checked(&mut self) -> AgentrailResult<()> {
        self.check_version()?;
        let snapshot = self.session.clone();
        self.write_unchecked(snapshot)
    }

    /// Re-reads the session file, discarding in-memory state.
    pub fn load(&mut self) -> AgentrailResult<()> {
        let path = self
            .paths
            .validate(self.path.as_path(), SESSION_PURPOSE, false)?;
        self.session = read_document(&path, &self.audit)?;
        self.path = path;
        Ok(())
    }

    /// Removes temporary files that interrupted writes left in the session
    /// file's directory, if older than `max_age`.
    pub fn reclaim_orphans(&self, max_age: Duration) -> AgentrailResult<usize> {
        let Some(dir) = self.path.as_path().parent() else {
            return Ok(0);
        };
        let removed = atomic::reclaim_orphans(dir, max_age)?;
        self.audit.log_event(
            "orphan_reclaim",
            AuditOutcome::Success,
            serde_json::json!({ "dir": dir.display().to_string(), "removed": removed }),
        );
        Ok(removed)
    }

    // --- Accessors ---

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn summary(&self) -> SessionSummary {
        self.session.summary()
    }

    pub fn latest(&self, agent: &str) -> Option<&AgentExecution> {
        self.session.latest(agent)
    }

    pub fn attempts(&self, agent: &str) -> Vec<&AgentExecution> {
        self.session.attempts(agent)
    }

    pub fn progress<S: AsRef<str>>(&self, expected: &[S]) -> PipelineProgress {
        self.session.progress(expected)
    }

    pub fn config(&self) -> &ValidationConfig {
        self.inputs.config()
    }

    // --- Internals ---

    fn validate_agent_and_message(&self, agent: &str, message: &str) -> AgentrailResult<()> {
        self.inputs.validate_identifier(agent)?;
        self.inputs.validate_message(message)?;
        Ok(())
    }

    fn finish(
        &mut self,
        agent: &str,
        target: ExecutionStatus,
        message: &str,
        reference: Option<i64>,
    ) -> AgentrailResult<Transition> {
        self.validate_agent_and_message(agent, message)?;
        let reference = reference
            .map(|n| self.inputs.validate_reference(n))
            .transpose()?;

        let mut next = self.session.clone();
        let transition = next.finish(agent, target, message, reference, Utc::now())?;
        if let Transition::Applied { .. } = transition {
            self.write(next)?;
        }
        Ok(transition)
    }

    fn apply<T>(
        &mut self,
        mutate: impl FnOnce(&mut Session) -> AgentrailResult<T>,
    ) -> AgentrailResult<T> {
        let mut next = self.session.clone();
        let value = mutate(&mut next)?;
        self.write(next)?;
        Ok(value)
    }

    fn write(&mut self, next: Session) -> AgentrailResult<()> {
        if self.policy == ConcurrencyPolicy::Optimistic {
            self.check_version()?;
        }
        self.write_unchecked(next)
    }

    fn write_unchecked(&mut self, mut next: Session) -> AgentrailResult<()> {
        next.version = self.session.version + 1;
        let payload = serde_json::to_vec_pretty(&next)?;

        match atomic::write_atomic(self.path.as_path(), &payload) {
            Ok(()) => {
                debug!(path = %self.path, version = next.version, "Session persisted");
                self.audit.log_event(
                    "session_persist",
                    AuditOutcome::Success,
                    serde_json::json!({
                        "session_id": next.id.to_string(),
                        "version": next.version,
                        "bytes": payload.len(),
                    }),
                );
                self.session = next;
                Ok(())
            }
            Err(e) => {
                warn!(path = %self.path, error = %e, "Session persist failed");
                self.audit.log_event(
                    "session_persist",
                    AuditOutcome::Error,
                    serde_json::json!({
                        "session_id": next.id.to_string(),
                        "error": e.to_string(),
                    }),
                );
                Err(e)
            }
        }
    }

    /// Compares the on-disk version with ours. A missing file counts as version 0.
    fn check_version(&self) -> AgentrailResult<()> {
        let found = match fs::read(self.path.as_path()) {
            Ok(bytes) => serde_json::from_slice::<VersionStamp>(&bytes)
                .map_err(|source| AgentrailError::SessionCorruption {
                    path: self.path.as_path().to_path_buf(),
                    source,
                })?
                .version,
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if found != self.session.version {
            self.audit.log_event(
                "session_persist",
                AuditOutcome::Denied,
                serde_json::json!({
                    "session_id": self.session.id.to_string(),
                    "expected_version": self.session.version,
                    "found_version": found,
                }),
            );
            return Err(AgentrailError::VersionConflict {
                path: self.path.as_path().to_path_buf(),
                expected: self.session.version,
                found,
            });
        }
        Ok(())
    }

    fn record<T>(
        &self,
        event: &str,
        agent: &str,
        result: &AgentrailResult<T>,
        context: impl FnOnce(&T) -> serde_json::Value,
    ) {
        let (outcome, mut details) = match result {
            Ok(value) => (AuditOutcome::Success, context(value)),
            Err(e) => (
                outcome_for(e),
                serde_json::json!({ "error": e.kind(), "detail": e.to_string() }),
            ),
        };
        if let Some(map) = details.as_object_mut() {
            map.insert("agent".to_string(), serde_json::json!(agent));
            map.insert(
                "session_id".to_string(),
                serde_json::json!(self.session.id.to_string()),
            );
        }
        self.audit.log_event(event, outcome, details);
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("path", &self.path)
            .field("session_id", &self.session.id)
            .field("version", &self.session.version)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Newest `*-pipeline.json` in the session directory, by name (names start
/// with a sortable timestamp).
pub fn latest_session_file(config: &ValidationConfig) -> AgentrailResult<Option<PathBuf>> {
    let entries = match fs::read_dir(config.session_dir()) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(String, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') || !name.ends_with(SESSION_FILE_SUFFIX) {
            continue;
        }
        if newest.as_ref().map_or(true, |(best, _)| name > *best) {
            newest = Some((name, entry.path()));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

fn read_document(path: &CanonicalPath, audit: &AuditLogger) -> AgentrailResult<Session> {
    let bytes = fs::read(path.as_path())?;
    let parsed = serde_json::from_slice::<Session>(&bytes).and_then(|session| {
        session
            .check_invariants()
            .map(|()| session)
            .map_err(<serde_json::Error as serde::de::Error>::custom)
    });

    match parsed {
        Ok(session) => {
            audit.log_event(
                "session_load",
                AuditOutcome::Success,
                serde_json::json!({
                    "session_id": session.id.to_string(),
                    "version": session.version,
                }),
            );
            Ok(session)
        }
        Err(source) => {
            warn!(path = %path, error = %source, "Session file is corrupt");
            audit.log_event(
                "session_load",
                AuditOutcome::Error,
                serde_json::json!({ "path": path.to_string(), "error": source.to_string() }),
            );
            Err(AgentrailError::SessionCorruption {
                path: path.as_path().to_path_buf(),
                source,
            })
        }
    }
}

fn outcome_for(error: &AgentrailError) -> AuditOutcome {
    match error {
        AgentrailError::PathSecurity(_)
        | AgentrailError::Validation(_)
        | AgentrailError::DuplicateStart { .. }
        | AgentrailError::UnknownExecution { .. }
        | AgentrailError::InvalidTransition { .. }
        | AgentrailError::AttemptsExhausted { .. }
        | AgentrailError::VersionConflict { .. } => AuditOutcome::Denied,
        _ => AuditOutcome::Error,
    }
}

fn transition_context(transition: &Transition) -> serde_json::Value {
    serde_json::json!({
        "attempt": transition.attempt(),
        "idempotent": matches!(transition, Transition::AlreadyDone { .. }),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentrail_security::ValidationMode;

    fn store_in(root: &Path) -> SessionStore {
        let config = ValidationConfig::builder(root)
            .mode(ValidationMode::Relaxed)
            .build()
            .unwrap();
        SessionStore::create(Arc::new(config), Arc::new(AuditLogger::disabled())).unwrap()
    }

    #[test]
    fn test_create_names_file_in_session_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let name = store.path().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.ends_with(SESSION_FILE_SUFFIX));
        assert!(store.path().parent().unwrap().ends_with("sessions"));
        assert_eq!(store.session().version, 1);
    }

    #[test]
    fn test_failed_validation_does_not_mutate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_in(tmp.path());
        let before = fs::read(store.path()).unwrap();

        assert!(store.start("bad name", "go", vec![]).is_err());
        assert!(store.start("researcher", "bell\x07", vec![]).is_err());
        assert!(store.session().executions.is_empty());
        assert_eq!(fs::read(store.path()).unwrap(), before);
    }

    #[test]
    fn test_reference_is_validated() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = store_in(tmp.path());
        store.start("researcher", "go", vec![]).unwrap();
        let err = store.complete("researcher", "done", Some(0)).unwrap_err();
        assert!(matches!(err, AgentrailError::Validation(_)));
        assert_eq!(
            store.latest("researcher").unwrap().status,
            ExecutionStatus::Running
        );

        store.complete("researcher", "done", Some(42)).unwrap();
        assert_eq!(store.latest("researcher").unwrap().reference, Some(42));
    }

    #[test]
    fn test_outcome_mapping() {
        let dup = AgentrailError::DuplicateStart {
            agent: "a".into(),
            attempt: 1,
        };
        assert_eq!(outcome_for(&dup), AuditOutcome::Denied);
        let io = AgentrailError::Io(io::Error::other("disk"));
        assert_eq!(outcome_for(&io), AuditOutcome::Error);
    }
}
