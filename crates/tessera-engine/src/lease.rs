//! Advisory leases over OS file locks.
//!
//! Writer coordination is lease-based: each subset is serialized by an
//! exclusive subset lease during seal, writers hold a shared dataset lease,
//! and GC/fsck/merge take the dataset lease exclusively against all writers.
//! Locks are `flock`-style through `fs2`, acquired through RAII guards that
//! release on every exit path. The lock directory may live on memory-backed
//! storage (see `EngineConfig::lock_dir`) so stale locks cannot survive a
//! crash.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use uuid::Uuid;

use crate::fsutil::makedirs_with_fsync;

/// Errors from lease acquisition.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LeaseError {
    /// The advisory lock is held elsewhere and the acquisition was
    /// non-blocking.
    #[error("lease denied: {path} is held by another process")]
    Denied {
        /// Lock file path.
        path: PathBuf,
    },

    /// Filesystem failure opening or locking the lock file.
    #[error("lease I/O error on {path}: {source}")]
    Io {
        /// Lock file path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
}

/// An acquired advisory lease. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct Lease {
    file: Option<File>,
    path: PathBuf,
}

impl Lease {
    /// A guard that holds nothing, for configurations with advisory locking
    /// disabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            file: None,
            path: PathBuf::new(),
        }
    }

    /// Lock file path, empty for a disabled guard.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn acquire(path: PathBuf, exclusive: bool, blocking: bool) -> Result<Self, LeaseError> {
        if let Some(parent) = path.parent() {
            makedirs_with_fsync(parent).map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })?;
        let locked = match (exclusive, blocking) {
            (true, true) => file.lock_exclusive().map(|()| true),
            (false, true) => file.lock_shared().map(|()| true),
            (true, false) => match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            },
            (false, false) => match fs2::FileExt::try_lock_shared(&file) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
                Err(e) => Err(e),
            },
        }
        .map_err(|source| LeaseError::Io {
            path: path.clone(),
            source,
        })?;
        if !locked {
            return Err(LeaseError::Denied { path });
        }
        Ok(Self {
            file: Some(file),
            path,
        })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

/// Lock file path for a subset lease.
#[must_use]
pub fn subset_lock_path(lock_root: &Path, subset_uuid: &Uuid) -> PathBuf {
    lock_root.join("subsets").join(format!("{subset_uuid}.lock"))
}

/// Lock file path for the dataset lease.
#[must_use]
pub fn dataset_lock_path(lock_root: &Path) -> PathBuf {
    lock_root.join("dataset.lock")
}

/// Acquire the exclusive subset lease for a seal, blocking behind the
/// current holder.
///
/// # Errors
///
/// Returns [`LeaseError::Io`] on filesystem failure.
pub fn acquire_subset(lock_root: &Path, subset_uuid: &Uuid) -> Result<Lease, LeaseError> {
    Lease::acquire(subset_lock_path(lock_root, subset_uuid), true, true)
}

/// Join the dataset's writer group: a shared lease refused only while a
/// maintenance operation holds the dataset exclusively.
///
/// # Errors
///
/// Returns [`LeaseError::Denied`] while GC/fsck/merge runs, or
/// [`LeaseError::Io`] on filesystem failure.
pub fn acquire_dataset_shared(lock_root: &Path) -> Result<Lease, LeaseError> {
    Lease::acquire(dataset_lock_path(lock_root), false, false)
}

/// Take the dataset exclusively for GC, fsck, rebuild, or merge. Refused
/// while any writer holds the shared lease.
///
/// # Errors
///
/// Returns [`LeaseError::Denied`] while writers are active, or
/// [`LeaseError::Io`] on filesystem failure.
pub fn acquire_dataset_exclusive(lock_root: &Path) -> Result<Lease, LeaseError> {
    Lease::acquire(dataset_lock_path(lock_root), true, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_lease_acquire_and_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let subset = Uuid::new_v4();
        {
            let lease = acquire_subset(tmp.path(), &subset).expect("first acquire");
            assert!(lease.path().exists());
        }
        // Released on drop; re-acquire succeeds.
        let _lease = acquire_subset(tmp.path(), &subset).expect("re-acquire");
    }

    #[test]
    fn test_exclusive_denied_while_shared_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let _writer = acquire_dataset_shared(tmp.path()).expect("shared");
        let err = acquire_dataset_exclusive(tmp.path()).expect_err("exclusive must be denied");
        assert!(matches!(err, LeaseError::Denied { .. }));
    }

    #[test]
    fn test_shared_denied_while_exclusive_held() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let _gc = acquire_dataset_exclusive(tmp.path()).expect("exclusive");
        let err = acquire_dataset_shared(tmp.path()).expect_err("shared must be denied");
        assert!(matches!(err, LeaseError::Denied { .. }));
    }

    #[test]
    fn test_shared_leases_coexist() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let _a = acquire_dataset_shared(tmp.path()).expect("a");
        let _b = acquire_dataset_shared(tmp.path()).expect("b");
    }

    #[test]
    fn test_disabled_lease_is_inert() {
        let lease = Lease::disabled();
        assert_eq!(lease.path(), Path::new(""));
    }
}
