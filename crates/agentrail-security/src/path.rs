use crate::audit::{AuditLogger, AuditOutcome};
use crate::config::ValidationConfig;
use agentrail_core::{PathRejection, PathSecurityError};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// System directories rejected in every mode.
const BLOCKED_DIRECTORIES: &[&str] = &["/etc/", "/usr/", "/var/", "/bin/", "/sbin/"];

/// An absolute, symlink-free path that passed every validation layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Authorizes filesystem paths against the configured roots.
///
/// Layers run in a fixed order and stop at the first failure:
///
/// 1. lexical rejection of `..` segments (either separator),
/// 2. rejection of a path that is itself a symlink, checked *before* any
///    resolution so the link cannot be normalized away,
/// 3. canonicalization,
/// 4. whitelist check against the allowed roots plus the system-directory
///    blocklist.
pub struct PathValidator {
    config: Arc<ValidationConfig>,
    roots: Vec<PathBuf>,
    audit: Arc<AuditLogger>,
}

impl PathValidator {
    /// Roots that already exist are canonicalized once here so that a root
    /// reached through a symlinked ancestor (e.g. a temp dir) still matches.
    pub fn new(config: Arc<ValidationConfig>, audit: Arc<AuditLogger>) -> Self {
        let roots = config
            .allowed_roots()
            .into_iter()
            .map(|root| fs::canonicalize(root).unwrap_or_else(|_| normalize(root)))
            .collect();
        Self {
            config,
            roots,
            audit,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validates `path` for `purpose`. `allow_missing` accepts a path that
    /// does not exist yet, e.g. a session file about to be created.
    pub fn validate(
        &self,
        path: impl AsRef<Path>,
        purpose: &str,
        allow_missing: bool,
    ) -> Result<CanonicalPath, PathSecurityError> {
        let path = path.as_ref();
        let raw = path.to_string_lossy();

        match self.check(path, &raw, allow_missing) {
            Ok(canonical) => {
                debug!(path = %canonical, purpose, "Path accepted");
                self.audit.log_event(
                    "path_validation",
                    AuditOutcome::Success,
                    serde_json::json!({
                        "path": raw,
                        "canonical": canonical.to_string(),
                        "purpose": purpose,
                    }),
                );
                Ok(canonical)
            }
            Err(reason) => {
                let err = PathSecurityError::new(&raw, purpose, reason);
                self.audit.log_event(
                    "path_validation",
                    AuditOutcome::Denied,
                    serde_json::json!({
                        "path": err.path,
                        "purpose": purpose,
                        "reason": err.reason.to_string(),
                    }),
                );
                Err(err)
            }
        }
    }

    fn check(
        &self,
        path: &Path,
        raw: &str,
        allow_missing: bool,
    ) -> Result<CanonicalPath, PathRejection> {
        // Layer 1: lexical traversal
        if raw.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(PathRejection::Traversal);
        }

        let absolute = if path.is_absolute() {
            normalize(path)
        } else {
            normalize(&self.config.project_root().join(path))
        };

        // Layer 2: the path itself must not be a symlink
        let exists = match fs::symlink_metadata(&absolute) {
            Ok(meta) if meta.file_type().is_symlink() => return Err(PathRejection::Symlink),
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(PathRejection::Unresolvable(e.to_string())),
        };
        if !exists && !allow_missing {
            return Err(PathRejection::Missing);
        }

        // Layer 3: canonicalize
        let canonical = if exists {
            fs::canonicalize(&absolute)
        } else {
            resolve_missing(&absolute)
        }
        .map_err(|e| PathRejection::Unresolvable(e.to_string()))?;

        // Layer 4: blocklist, then whitelist
        for candidate in [raw.to_string(), canonical.to_string_lossy().into_owned()] {
            if let Some(marker) = blocked_marker(&candidate) {
                return Err(PathRejection::SystemDirectory { marker });
            }
        }
        if !self.roots.iter().any(|root| canonical.starts_with(root)) {
            return Err(PathRejection::OutsideAllowedRoots {
                canonical: canonical.display().to_string(),
            });
        }

        Ok(CanonicalPath(canonical))
    }
}

impl fmt::Debug for PathValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathValidator")
            .field("mode", &self.config.mode())
            .field("roots", &self.roots)
            .finish()
    }
}

/// Finds a blocked directory marker anywhere in `path`. Backslashes count as
/// separators and a trailing separator is implied, so `/etc` is caught as
/// well as `/etc/passwd` and `<root>/etc/passwd`.
fn blocked_marker(path: &str) -> Option<&'static str> {
    let mut normalized = path.replace('\\', "/");
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    BLOCKED_DIRECTORIES
        .iter()
        .copied()
        .find(|marker| normalized.contains(marker))
}

/// Drops `.` components without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Canonicalizes the nearest existing ancestor and re-appends the missing tail.
fn resolve_missing(absolute: &Path) -> io::Result<PathBuf> {
    let mut existing = absolute.to_path_buf();
    let mut tail: Vec<OsString> = Vec::new();

    loop {
        match fs::symlink_metadata(&existing) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let name = existing.file_name().map(ToOwned::to_owned).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no existing ancestor")
                })?;
                tail.push(name);
                if !existing.pop() {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "no existing ancestor",
                    ));
                }
            }
            Err(e) => return Err(e),
        }
    }

    let mut canonical = fs::canonicalize(&existing)?;
    for component in tail.iter().rev() {
        canonical.push(component);
    }
    Ok(canonical)
}
