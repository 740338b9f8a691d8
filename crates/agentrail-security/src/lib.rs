//! Security primitives for agentrail.
//!
//! Every file the session store touches and every value a caller hands it
//! passes through this crate first.
//!
//! # Main types
//!
//! - [`ValidationConfig`]: Immutable allow-lists, size limits and mode flag.
//! - [`PathValidator`]: Four-layer path check (traversal, symlink, canonicalize, whitelist).
//! - [`InputValidator`]: Identifier, message and numeric reference checks.
//! - [`AuditLogger`]: Append-only, size-rotated JSON-lines audit trail.

/// Audit logging module.
pub mod audit;
/// Validation configuration.
pub mod config;
/// Filesystem path validation.
pub mod path;
/// Input validation for identifiers, messages and references.
pub mod validator;

pub use audit::{AuditEntry, AuditLogger, AuditOutcome};
pub use config::{ValidationConfig, ValidationConfigBuilder, ValidationMode, DEFAULT_AGENTS};
pub use path::{CanonicalPath, PathValidator};
pub use validator::InputValidator;
