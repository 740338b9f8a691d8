//! Core error types for the agentrail workspace.
//!
//! Every crate in the workspace reports failures through [`AgentrailError`],
//! so callers (the CLI, hook scripts, reporting tools) can match on a single
//! taxonomy regardless of which layer rejected the operation.
//!
//! # Main types
//!
//! - [`AgentrailError`]: Unified error enum for validation, state-machine and persistence failures.
//! - [`AgentrailResult`]: Convenience alias for `Result<T, AgentrailError>`.
//! - [`PathSecurityError`]: A filesystem path rejected by the path validator.
//! - [`ValidationError`]: A malformed identifier, message or numeric reference.

/// Error definitions.
pub mod error;

pub use error::{
    redact, AgentrailError, AgentrailResult, PathRejection, PathSecurityError, ValidationError,
};
