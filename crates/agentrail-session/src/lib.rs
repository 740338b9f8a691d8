//! Session state store for multi-agent pipelines.
//!
//! Records which agents of a pipeline run started, finished or failed, and
//! keeps that record in a single JSON file that is only ever replaced
//! atomically.

/// Atomic file replacement and orphan cleanup.
pub mod atomic;
pub mod session;
pub mod store;

pub use session::{
    AgentExecution, ExecutionStatus, PipelineProgress, Session, SessionStatus, SessionSummary,
    Transition,
};
pub use store::{latest_session_file, ConcurrencyPolicy, SessionStore};
