//! Exclusive lock serializing bootstrap and approval on one host.

use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{FirewallError, Result};

/// Held for as long as the value lives; the kernel drops the lock on close.
pub struct InstallLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl InstallLock {
    /// Block until the lock is free.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::lock(path, FlockArg::LockExclusive)
    }

    /// Fail immediately if another process holds the lock.
    pub fn try_acquire(path: &Path) -> Result<Self> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    /// [`acquire`](Self::acquire) when `wait` is set, else [`try_acquire`](Self::try_acquire).
    pub fn take(path: &Path, wait: bool) -> Result<Self> {
        if wait {
            Self::acquire(path)
        } else {
            Self::try_acquire(path)
        }
    }

    fn lock(path: &Path, arg: FlockArg) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FirewallError::Lock {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| FirewallError::Lock {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let file = Flock::lock(file, arg).map_err(|(_, errno)| FirewallError::Lock {
            path: path.to_path_buf(),
            reason: errno.desc().to_string(),
        })?;
        debug!("Acquired lock {}", path.display());

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
