//! Crash-consistent file replacement.
//!
//! A write goes to a uniquely named temporary file in the destination's own
//! directory (so the final rename never crosses a filesystem), is flushed to
//! disk, and then renamed over the destination in a single step. Readers see
//! either the old file or the new one. If anything fails before the rename
//! the temporary file is removed and the destination is untouched; a process
//! killed in between leaves an orphaned temporary file, which
//! [`reclaim_orphans`] cleans up later.

use agentrail_core::{AgentrailError, AgentrailResult};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Prefix of every temporary file created by [`stage`].
pub const TEMP_PREFIX: &str = ".agentrail-";
/// Suffix of every temporary file created by [`stage`].
pub const TEMP_SUFFIX: &str = ".tmp";

/// A fully written temporary file waiting to replace its destination.
///
/// Dropping it without calling [`commit`](StagedWrite::commit) deletes the
/// temporary file.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    destination: PathBuf,
}

impl StagedWrite {
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Renames the temporary file over the destination.
    pub fn commit(self) -> AgentrailResult<()> {
        let destination = self.destination;
        // On failure the returned NamedTempFile is dropped, which removes it.
        self.temp
            .persist(&destination)
            .map_err(|e| persistence_error(&destination, e.error))?;
        sync_parent(&destination);
        Ok(())
    }
}

/// Writes `payload` to a new temporary file next to `destination` and fsyncs it.
pub fn stage(destination: &Path, payload: &[u8]) -> AgentrailResult<StagedWrite> {
    let dir = destination.parent().ok_or_else(|| {
        persistence_error(
            destination,
            io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent directory"),
        )
    })?;

    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| persistence_error(destination, e))?;

    temp.write_all(payload)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| persistence_error(destination, e))?;

    debug!(
        destination = %destination.display(),
        temp = %temp.path().display(),
        bytes = payload.len(),
        "Staged atomic write"
    );
    Ok(StagedWrite {
        temp,
        destination: destination.to_path_buf(),
    })
}

/// Replaces `destination` with `payload` atomically.
pub fn write_atomic(destination: &Path, payload: &[u8]) -> AgentrailResult<()> {
    stage(destination, payload)?.commit()
}

/// Deletes temporary files left behind in `dir` by interrupted writes that
/// are at least `max_age` old. Returns how many were removed.
pub fn reclaim_orphans(dir: &Path, max_age: Duration) -> AgentrailResult<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)) {
            continue;
        }

        let meta = fs::symlink_metadata(entry.path())?;
        if !meta.file_type().is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        match fs::remove_file(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if removed > 0 {
        warn!(dir = %dir.display(), removed, "Reclaimed orphaned temporary files");
    }
    Ok(removed)
}

fn persistence_error(path: &Path, source: io::Error) -> AgentrailError {
    AgentrailError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

/// Flushes the directory entry so the rename survives a power loss. The
/// rename already happened, so a failure here is only logged.
fn sync_parent(path: &Path) {
    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "Directory fsync failed");
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(TEMP_PREFIX))
            })
            .collect()
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("state.json");
        fs::write(&dest, "old").unwrap();

        write_atomic(&dest, b"new").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "new");
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_staged_write_lives_next_to_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("state.json");
        let staged = stage(&dest, b"payload").unwrap();
        assert_eq!(staged.temp_path().parent(), dest.parent());
        assert_eq!(fs::read(staged.temp_path()).unwrap(), b"payload");
        staged.commit().unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");
    }

    #[test]
    fn test_dropped_stage_leaves_destination_and_no_temp() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("state.json");
        fs::write(&dest, "before").unwrap();

        drop(stage(&dest, b"after").unwrap());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "before");
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_missing_directory_is_persistence_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("no-such-dir").join("state.json");
        let err = write_atomic(&dest, b"x").unwrap_err();
        assert!(matches!(err, AgentrailError::Persistence { .. }));
    }

    #[test]
    fn test_commit_onto_directory_fails_and_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("occupied");
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("keep.txt"), "x").unwrap();

        let err = write_atomic(&dest, b"x").unwrap_err();
        assert!(matches!(err, AgentrailError::Persistence { .. }));
        assert!(dest.join("keep.txt").exists());
        assert!(temp_files(tmp.path()).is_empty());
    }

    #[test]
    fn test_reclaim_respects_age_and_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("state.json");
        std::mem::forget(stage(&dest, b"orphan").unwrap());
        fs::write(tmp.path().join("unrelated.tmp"), "keep").unwrap();

        assert_eq!(reclaim_orphans(tmp.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(reclaim_orphans(tmp.path(), Duration::ZERO).unwrap(), 1);
        assert!(tmp.path().join("unrelated.tmp").exists());
        assert!(temp_files(tmp.path()).is_empty());
    }
}
