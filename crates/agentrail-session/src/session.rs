use agentrail_core::{AgentrailError, AgentrailResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Lifecycle of one attempt: `pending → running → {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ExecutionStatus {
    /// Completed and failed attempts never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Failed)
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (ExecutionStatus::Pending, ExecutionStatus::Running)
                | (ExecutionStatus::Running, ExecutionStatus::Completed)
                | (ExecutionStatus::Running, ExecutionStatus::Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One agent's attempt within a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentExecution {
    pub agent: String,
    /// Starts at 1 and increases by one per new attempt of the same agent.
    pub attempt: u32,
    pub status: ExecutionStatus,
    /// When the attempt started running. For a pending attempt, when it was queued.
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    /// External reference such as an issue number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<u32>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentExecution {
    fn new(
        agent: &str,
        attempt: u32,
        status: ExecutionStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            attempt,
            status,
            started_at: now,
            ended_at: None,
            message: message.to_string(),
            reference: None,
            tools: Vec::new(),
        }
    }

    /// Seconds between start and end, `None` while not finished.
    pub fn duration_seconds(&self) -> Option<f64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds() as f64 / 1000.0)
    }

    /// `[start, end]`, or `[start, now]` while running. Pending attempts have none.
    pub fn interval(&self, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match self.status {
            ExecutionStatus::Pending => None,
            ExecutionStatus::Running => Some((self.started_at, now.max(self.started_at))),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                Some((self.started_at, self.ended_at.unwrap_or(self.started_at)))
            }
        }
    }
}

/// Overall status, derived from the latest attempt of every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No agent has been recorded yet.
    Empty,
    Pending,
    Running,
    Failed,
    Completed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Empty => "empty",
            SessionStatus::Pending => "pending",
            SessionStatus::Running => "running",
            SessionStatus::Failed => "failed",
            SessionStatus::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// Result of a `complete`/`fail` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The running attempt moved to its terminal state.
    Applied { attempt: u32 },
    /// The latest attempt was already in the requested state; nothing changed.
    AlreadyDone { attempt: u32 },
}

impl Transition {
    pub fn attempt(self) -> u32 {
        match self {
            Transition::Applied { attempt } | Transition::AlreadyDone { attempt } => attempt,
        }
    }
}

/// Counts for reporting tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub status: SessionStatus,
    /// Agents in the order they first appeared.
    pub agents: Vec<String>,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_attempts: usize,
}

/// Which expected pipeline agents have completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineProgress {
    pub completed: Vec<String>,
    pub remaining: Vec<String>,
}

impl PipelineProgress {
    pub fn is_complete(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// One pipeline run: the persisted document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    /// Incremented on every successful persist.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub executions: Vec<AgentExecution>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            schema_version: SCHEMA_VERSION,
            version: 0,
            executions: Vec::new(),
        }
    }

    /// The most recent attempt for `agent`.
    pub fn latest(&self, agent: &str) -> Option<&AgentExecution> {
        self.executions
            .iter()
            .filter(|e| e.agent == agent)
            .max_by_key(|e| e.attempt)
    }

    fn latest_mut(&mut self, agent: &str) -> Option<&mut AgentExecution> {
        self.executions
            .iter_mut()
            .filter(|e| e.agent == agent)
            .max_by_key(|e| e.attempt)
    }

    /// All attempts for `agent`, oldest first.
    pub fn attempts(&self, agent: &str) -> Vec<&AgentExecution> {
        let mut attempts: Vec<&AgentExecution> =
            self.executions.iter().filter(|e| e.agent == agent).collect();
        attempts.sort_by_key(|e| e.attempt);
        attempts
    }

    /// Agent names in first-seen order.
    pub fn agents(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.executions
            .iter()
            .filter(|e| seen.insert(e.agent.as_str()))
            .map(|e| e.agent.as_str())
            .collect()
    }

    /// Moves `agent` to running: a pending attempt is promoted, otherwise a new
    /// attempt is opened. Returns the attempt number.
    pub fn begin(
        &mut self,
        agent: &str,
        message: &str,
        tools: Vec<String>,
        now: DateTime<Utc>,
    ) -> AgentrailResult<u32> {
        let next_attempt = match self.latest_mut(agent) {
            Some(latest) if latest.status == ExecutionStatus::Running => {
                return Err(AgentrailError::DuplicateStart {
                    agent: agent.to_string(),
                    attempt: latest.attempt,
                });
            }
            Some(latest) if latest.status == ExecutionStatus::Pending => {
                latest.status = ExecutionStatus::Running;
                latest.started_at = now;
                latest.message = message.to_string();
                latest.tools = tools;
                return Ok(latest.attempt);
            }
            Some(latest) => following_attempt(agent, latest.attempt)?,
            None => 1,
        };

        let mut execution =
            AgentExecution::new(agent, next_attempt, ExecutionStatus::Running, message, now);
        execution.tools = tools;
        self.executions.push(execution);
        Ok(next_attempt)
    }

    /// Queues a pending attempt. Returns `None` when one is already pending.
    pub fn enqueue(
        &mut self,
        agent: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> AgentrailResult<Option<u32>> {
        let next_attempt = match self.latest(agent) {
            Some(latest) if latest.status == ExecutionStatus::Running => {
                return Err(AgentrailError::DuplicateStart {
                    agent: agent.to_string(),
                    attempt: latest.attempt,
                });
            }
            Some(latest) if latest.status == ExecutionStatus::Pending => return Ok(None),
            Some(latest) => following_attempt(agent, latest.attempt)?,
            None => 1,
        };

        self.executions.push(AgentExecution::new(
            agent,
            next_attempt,
            ExecutionStatus::Pending,
            message,
            now,
        ));
        Ok(Some(next_attempt))
    }

    /// Moves the running attempt of `agent` to `target` (completed or failed).
    /// Repeating the call once the attempt already reached `target` is a no-op.
    pub fn finish(
        &mut self,
        agent: &str,
        target: ExecutionStatus,
        message: &str,
        reference: Option<u32>,
        now: DateTime<Utc>,
    ) -> AgentrailResult<Transition> {
        let Some(latest) = self.latest_mut(agent) else {
            return Err(AgentrailError::UnknownExecution {
                agent: agent.to_string(),
            });
        };

        if latest.status == target && target.is_terminal() {
            return Ok(Transition::AlreadyDone {
                attempt: latest.attempt,
            });
        }
        if !latest.status.can_transition_to(target) {
            return Err(AgentrailError::InvalidTransition {
                agent: agent.to_string(),
                attempt: latest.attempt,
                from: latest.status.to_string(),
                to: target.to_string(),
            });
        }

        latest.status = target;
        // A clock stepping backwards must not produce end < start.
        latest.ended_at = Some(now.max(latest.started_at));
        latest.message = message.to_string();
        if reference.is_some() {
            latest.reference = reference;
        }
        Ok(Transition::Applied {
            attempt: latest.attempt,
        })
    }

    /// True when at least two of `agents`' latest attempts ran at the same
    /// time. Intervals that merely touch (one ends exactly when the other
    /// starts) do not count; agents never started are ignored.
    pub fn verify_overlap<S: AsRef<str>>(&self, agents: &[S], now: DateTime<Utc>) -> bool {
        let mut seen = HashSet::new();
        let intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = agents
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| seen.insert(*name))
            .filter_map(|name| self.latest(name))
            .filter_map(|e| e.interval(now))
            .collect();

        intervals.iter().enumerate().any(|(i, (a_start, a_end))| {
            intervals[i + 1..]
                .iter()
                .any(|(b_start, b_end)| a_start < b_end && b_start < a_end)
        })
    }

    pub fn status(&self) -> SessionStatus {
        let latest: Vec<ExecutionStatus> = self
            .agents()
            .into_iter()
            .filter_map(|agent| self.latest(agent))
            .map(|e| e.status)
            .collect();

        if latest.is_empty() {
            SessionStatus::Empty
        } else if latest.contains(&ExecutionStatus::Running) {
            SessionStatus::Running
        } else if latest.contains(&ExecutionStatus::Pending) {
            SessionStatus::Pending
        } else if latest.contains(&ExecutionStatus::Failed) {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let agents: Vec<String> = self.agents().into_iter().map(str::to_string).collect();
        let count = |status: ExecutionStatus| {
            agents
                .iter()
                .filter_map(|a| self.latest(a))
                .filter(|e| e.status == status)
                .count()
        };
        SessionSummary {
            session_id: self.id,
            status: self.status(),
            pending: count(ExecutionStatus::Pending),
            running: count(ExecutionStatus::Running),
            completed: count(ExecutionStatus::Completed),
            failed: count(ExecutionStatus::Failed),
            total_attempts: self.executions.len(),
            agents,
        }
    }

    pub fn progress<S: AsRef<str>>(&self, expected: &[S]) -> PipelineProgress {
        let (completed, remaining): (Vec<String>, Vec<String>) = expected
            .iter()
            .map(|a| a.as_ref().to_string())
            .partition(|a| {
                self.latest(a)
                    .is_some_and(|e| e.status == ExecutionStatus::Completed)
            });
        PipelineProgress {
            completed,
            remaining,
        }
    }

    /// Structural checks run on every loaded document.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut keys = HashSet::new();
        for e in &self.executions {
            let well_formed = !e.agent.is_empty()
                && e.agent
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !well_formed {
                return Err(format!("agent name {:?} is not a valid identifier", e.agent));
            }
            if e.attempt == 0 {
                return Err(format!("agent '{}' has attempt number 0", e.agent));
            }
            if !keys.insert((e.agent.as_str(), e.attempt)) {
                return Err(format!(
                    "agent '{}' attempt {} is recorded twice",
                    e.agent, e.attempt
                ));
            }
            match (e.status.is_terminal(), e.ended_at) {
                (true, None) => {
                    return Err(format!(
                        "agent '{}' attempt {} is {} without an end timestamp",
                        e.agent, e.attempt, e.status
                    ));
                }
                (false, Some(_)) => {
                    return Err(format!(
                        "agent '{}' attempt {} is {} but has an end timestamp",
                        e.agent, e.attempt, e.status
                    ));
                }
                (true, Some(end)) if end < e.started_at => {
                    return Err(format!(
                        "agent '{}' attempt {} ends before it starts",
                        e.agent, e.attempt
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn following_attempt(agent: &str, latest: u32) -> AgentrailResult<u32> {
    latest
        .checked_add(1)
        .ok_or_else(|| AgentrailError::AttemptsExhausted {
            agent: agent.to_string(),
            attempt: latest,
        })
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).unwrap()
    }

    fn run(session: &mut Session, agent: &str, start: DateTime<Utc>, end: Option<DateTime<Utc>>) {
        session.begin(agent, "go", vec![], start).unwrap();
        if let Some(end) = end {
            session
                .finish(agent, ExecutionStatus::Completed, "done", None, end)
                .unwrap();
        }
    }

    #[test]
    fn test_state_machine_edges() {
        use ExecutionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
    }

    #[test]
    fn test_overlapping_intervals() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 5)));
        run(&mut session, "B", at(10, 2), Some(at(10, 6)));
        assert!(session.verify_overlap(&["A", "B"], at(11, 0)));
    }

    #[test]
    fn test_sequential_intervals() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 5)));
        run(&mut session, "B", at(10, 6), Some(at(10, 10)));
        assert!(!session.verify_overlap(&["A", "B"], at(11, 0)));
    }

    #[test]
    fn test_touching_intervals_do_not_overlap() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 5)));
        run(&mut session, "B", at(10, 5), Some(at(10, 9)));
        assert!(!session.verify_overlap(&["A", "B"], at(11, 0)));
    }

    #[test]
    fn test_running_agent_extends_to_now() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), None);
        run(&mut session, "B", at(10, 30), Some(at(10, 40)));
        assert!(session.verify_overlap(&["A", "B"], at(11, 0)));
        assert!(!session.verify_overlap(&["A", "B"], at(10, 20)));
    }

    #[test]
    fn test_overlap_needs_two_agents() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 5)));
        assert!(!session.verify_overlap(&["A"], at(11, 0)));
        assert!(!session.verify_overlap(&["A", "A"], at(11, 0)));
        assert!(!session.verify_overlap(&["A", "never-started"], at(11, 0)));
    }

    #[test]
    fn test_backwards_clock_clamped() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(9, 0)));
        let e = session.latest("A").unwrap();
        assert_eq!(e.ended_at, Some(e.started_at));
        assert_eq!(e.duration_seconds(), Some(0.0));
    }

    #[test]
    fn test_status_derivation() {
        let mut session = Session::new();
        assert_eq!(session.status(), SessionStatus::Empty);

        session.enqueue("planner", "queued", at(9, 0)).unwrap();
        assert_eq!(session.status(), SessionStatus::Pending);

        run(&mut session, "researcher", at(10, 0), None);
        assert_eq!(session.status(), SessionStatus::Running);

        session
            .finish("researcher", ExecutionStatus::Failed, "boom", None, at(10, 1))
            .unwrap();
        session.begin("planner", "go", vec![], at(10, 2)).unwrap();
        session
            .finish("planner", ExecutionStatus::Completed, "ok", None, at(10, 3))
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Failed);

        run(&mut session, "researcher", at(10, 4), Some(at(10, 5)));
        assert_eq!(session.status(), SessionStatus::Completed);
    }

    #[test]
    fn test_progress() {
        let mut session = Session::new();
        run(&mut session, "researcher", at(10, 0), Some(at(10, 1)));
        run(&mut session, "planner", at(10, 2), None);
        let progress = session.progress(&["researcher", "planner", "implementer"]);
        assert_eq!(progress.completed, vec!["researcher".to_string()]);
        assert_eq!(progress.remaining, vec!["planner".to_string(), "implementer".to_string()]);
        assert!(!progress.is_complete());
    }

    #[test]
    fn test_last_attempt_number_cannot_be_exceeded() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 1)));
        session.executions[0].attempt = u32::MAX;

        let err = session.begin("A", "again", vec![], at(10, 2)).unwrap_err();
        assert!(matches!(
            err,
            AgentrailError::AttemptsExhausted { attempt: u32::MAX, .. }
        ));
        assert!(session.enqueue("A", "again", at(10, 2)).is_err());
        assert_eq!(session.executions.len(), 1);
    }

    #[test]
    fn test_invariants_reject_malformed_agent_names() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 1)));
        session.executions[0].agent = "evil\u{1b}[2J".to_string();
        assert!(session.check_invariants().unwrap_err().contains("not a valid identifier"));
    }

    #[test]
    fn test_invariants_catch_duplicates() {
        let mut session = Session::new();
        run(&mut session, "A", at(10, 0), Some(at(10, 1)));
        let dup = session.executions[0].clone();
        session.executions.push(dup);
        assert!(session.check_invariants().unwrap_err().contains("twice"));
    }
}
