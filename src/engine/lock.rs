//! Cross-process apply lock
//!
//! Only one apply may run on a machine at a time. The lock is an exclusive
//! file lock held for the lifetime of [`ApplyLock`]; a second apply blocks
//! until the first releases it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};

/// Default lock file name under the system temp directory
pub const LOCK_FILE: &str = "bootstrapper-apply.lock";

pub fn default_lock_path() -> PathBuf {
    crate::temp::system_temp_dir().join(LOCK_FILE)
}

/// Held apply lock; released on drop
#[derive(Debug)]
pub struct ApplyLock {
    file: File,
    path: PathBuf,
}

impl ApplyLock {
    /// Block until the lock at `path` is acquired
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| lock_failed(path, &e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| lock_failed(path, &e))?;

        debug!(path = %path.display(), "waiting for apply lock");
        FileExt::lock_exclusive(&file).map_err(|e| lock_failed(path, &e))?;
        info!(path = %path.display(), "apply lock acquired");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ApplyLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), error = %e, "failed to release apply lock");
        } else {
            debug!(path = %self.path.display(), "apply lock released");
        }
    }
}

fn lock_failed(path: &Path, err: &std::io::Error) -> BootstrapError {
    BootstrapError::ApplyLockFailed {
        reason: format!("{}: {err}", path.display()),
    }
}
