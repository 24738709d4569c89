//! Directory and path helpers shared by the map and sequence containers.
//!
//! Both containers open a small fixed set of files inside one directory, and both
//! need identical "does the directory already hold a container" semantics before
//! deciding whether to create or open. Kept as a standalone module rather than inlined
//! at each call site for that reason.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};

/// Joins `dir` and `name` into a single path.
#[must_use]
pub fn join(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

fn open_dirs() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN_DIRS: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN_DIRS.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Normalizes `dir` for use as a registry key. Falls back to the path as given when it
/// does not yet exist (e.g. a container about to be created for the first time).
fn registry_key(dir: &Path) -> PathBuf {
    std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf())
}

/// Marks `dir` as open for this process, failing with [`Error::AlreadyOpen`] if another
/// handle already holds it open. Guards against a second `open` against the same
/// directory from the same process; it is not a cross-process lock (see SPEC_FULL.md's
/// concurrency model — two processes must not open the same directory at all).
///
/// # Errors
///
/// Returns [`Error::AlreadyOpen`] if `dir` is already marked open.
pub fn mark_open(dir: &Path) -> Result<()> {
    let key = registry_key(dir);
    let mut open = open_dirs().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if !open.insert(key) {
        return Err(Error::AlreadyOpen(dir.display().to_string()));
    }
    Ok(())
}

/// Releases the open-tracking mark for `dir`, so a later `open` against it can succeed.
/// Safe to call on a directory that was never marked open.
pub fn mark_closed(dir: &Path) {
    let key = registry_key(dir);
    let mut open = open_dirs().lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    open.remove(&key);
}

/// Returns true if `dir` exists and already looks like an initialized container
/// directory, i.e. it contains a file named `marker`.
#[must_use]
pub fn is_initialized(dir: &Path, marker: &str) -> bool {
    dir.join(marker).is_file()
}

/// Creates `dir` (and any missing parent directories) if it does not already exist.
///
/// # Errors
///
/// Returns [`crate::error::Error::IoError`] if directory creation fails.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn join_combines_dir_and_name() {
        let dir = Path::new("/tmp/foo");
        assert_eq!(join(dir, "index.bin"), PathBuf::from("/tmp/foo/index.bin"));
    }

    #[test]
    fn ensure_dir_creates_missing_directories() {
        let base = tempdir().unwrap();
        let nested = base.path().join("a").join("b");
        assert!(!nested.exists());
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn is_initialized_checks_marker_file() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path(), "index.bin"));
        std::fs::write(dir.path().join("index.bin"), b"x").unwrap();
        assert!(is_initialized(dir.path(), "index.bin"));
    }

    #[test]
    fn mark_open_rejects_second_open_until_closed() {
        let dir = tempdir().unwrap();
        mark_open(dir.path()).unwrap();
        let err = mark_open(dir.path()).unwrap_err();
        assert!(matches!(err, crate::error::Error::AlreadyOpen(_)));
        mark_closed(dir.path());
        mark_open(dir.path()).unwrap();
        mark_closed(dir.path());
    }

    #[test]
    fn mark_closed_on_unopened_dir_is_a_no_op() {
        let dir = tempdir().unwrap();
        mark_closed(dir.path());
    }
}
