//! Filesystem primitives for crash-safe publication: directory fsync,
//! fsynced directory creation, stale-temporary sweeps, and root-confined
//! deletion.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock as microseconds since the Unix epoch.
#[must_use]
pub fn now_epoch_us() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(now.as_micros()).unwrap_or(i64::MAX)
}

/// fsync a directory so a prior rename or unlink inside it is durable.
///
/// # Errors
///
/// Returns the underlying I/O error; callers on best-effort paths may drop
/// it.
pub fn fsync_dir(path: &Path) -> io::Result<()> {
    fs::File::open(path)?.sync_all()
}

/// Create `path` and any missing parents, fsyncing each parent that gained
/// an entry so the directory chain survives a crash.
///
/// # Errors
///
/// Returns the first I/O error encountered.
pub fn makedirs_with_fsync(path: &Path) -> io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = path.to_path_buf();
    while !cursor.is_dir() {
        missing.push(cursor.clone());
        match cursor.parent() {
            Some(parent) if parent != cursor => cursor = parent.to_path_buf(),
            _ => break,
        }
    }
    for dir in missing.iter().rev() {
        fs::create_dir_all(dir)?;
        if let Some(parent) = dir.parent() {
            let _ = fsync_dir(parent);
        }
    }
    Ok(())
}

/// Remove `*.tmp` entries in `dir` older than `horizon_secs`. Returns how
/// many were removed. Failures on individual entries are skipped; a crashed
/// writer's temporaries must never block a live one.
pub fn sweep_stale_tmps(dir: &Path, horizon_secs: u64) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    let now = SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let stale = now
            .duration_since(modified)
            .map(|age| age.as_secs() >= horizon_secs)
            .unwrap_or(false);
        if stale && fs::remove_file(&path).is_ok() {
            removed += 1;
        }
    }
    if removed > 0 {
        let _ = fsync_dir(dir);
    }
    removed
}

/// Join a relative path onto `root`, refusing traversal outside it.
///
/// # Errors
///
/// Returns `InvalidInput` when `rel` is absolute or escapes the root.
pub fn join_inside(root: &Path, rel: &Path) -> io::Result<PathBuf> {
    if rel.is_absolute() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("absolute path not allowed: {}", rel.display()),
        ));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes dataset root: {}", rel.display()),
                ))
            }
        }
    }
    Ok(root.join(rel))
}

/// Unlink a file addressed relative to the dataset root, fsyncing its
/// directory. Returns whether a file was removed.
///
/// # Errors
///
/// Returns an I/O error on unsafe paths or failed removal.
pub fn safe_unlink_inside(root: &Path, rel: &Path) -> io::Result<bool> {
    let target = join_inside(root, rel)?;
    if !target.exists() {
        return Ok(false);
    }
    fs::remove_file(&target)?;
    if let Some(parent) = target.parent() {
        let _ = fsync_dir(parent);
    }
    Ok(true)
}

/// Remove empty directories from `start` upwards, stopping at `stop_at`.
pub fn prune_empty_dirs(start: &Path, stop_at: &Path) {
    let mut cursor = start.to_path_buf();
    while cursor.starts_with(stop_at) && cursor != stop_at {
        if fs::remove_dir(&cursor).is_err() {
            break;
        }
        match cursor.parent() {
            Some(parent) => cursor = parent.to_path_buf(),
            None => break,
        }
    }
}

/// Restrict a path to its owner (0700 directories, 0600 files) when POSIX
/// hardening is enabled. A no-op elsewhere.
pub fn apply_owner_only_perms(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            let mode = if meta.is_dir() { 0o700 } else { 0o600 };
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_makedirs_creates_chain() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let deep = tmp.path().join("a/b/c");
        makedirs_with_fsync(&deep).expect("mkdirs");
        assert!(deep.is_dir());
        // Idempotent.
        makedirs_with_fsync(&deep).expect("mkdirs again");
    }

    #[test]
    fn test_sweep_removes_only_stale_tmps() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let stale = tmp.path().join("old.h5.tmp");
        let fresh = tmp.path().join("new.h5.tmp");
        let data = tmp.path().join("keep.h5");
        fs::write(&stale, b"x").expect("write");
        fs::write(&fresh, b"x").expect("write");
        fs::write(&data, b"x").expect("write");

        assert_eq!(sweep_stale_tmps(tmp.path(), 0), 2);
        assert!(!stale.exists());
        assert!(!fresh.exists());
        assert!(data.exists());

        fs::write(&fresh, b"x").expect("write");
        assert_eq!(sweep_stale_tmps(tmp.path(), 3600), 0);
        assert!(fresh.exists());
    }

    #[test]
    fn test_safe_unlink_refuses_escape() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let err = safe_unlink_inside(tmp.path(), Path::new("../outside")).expect_err("escape");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(safe_unlink_inside(tmp.path(), Path::new("missing")).expect("ok") == false);
        let f = tmp.path().join("x");
        fs::write(&f, b"x").expect("write");
        assert!(safe_unlink_inside(tmp.path(), Path::new("x")).expect("ok"));
        assert!(!f.exists());
    }

    #[test]
    fn test_prune_stops_at_boundary() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let deep = tmp.path().join("a/b/c");
        fs::create_dir_all(&deep).expect("mkdirs");
        prune_empty_dirs(&deep, tmp.path());
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().is_dir());
    }
}
