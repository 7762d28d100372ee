//! Permission reset and hardening
//!
//! Artifacts are reset to the permissions of the directory they are promoted
//! into before promotion. Working folders created while elevated are
//! restricted to administrators.

use std::path::Path;

use tracing::debug;

use super::transfer::RetryPolicy;
use crate::error::Result;

/// Reset `path` so it carries the permissions `destination_dir` would give it
pub fn reset_permissions(path: &Path, destination_dir: &Path, retry: &RetryPolicy) -> Result<()> {
    debug!(path = %path.display(), "resetting permissions");
    retry.run("reset permissions", path, || {
        platform::reset_permissions(path, destination_dir)
    })
}

/// Restrict a directory to administrators and the system account
pub fn harden_directory(path: &Path, retry: &RetryPolicy) -> Result<()> {
    debug!(path = %path.display(), "hardening directory");
    retry.run("harden directory", path, || platform::harden_directory(path))
}

#[cfg(unix)]
mod platform {
    use std::fs;
    use std::io;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    const OWNER_ONLY: u32 = 0o700;

    pub(super) fn reset_permissions(path: &Path, destination_dir: &Path) -> io::Result<()> {
        let mode = inherited_mode(destination_dir)?;
        let metadata = fs::metadata(path)?;
        let mode = if metadata.is_dir() { mode } else { mode & 0o777 };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
    }

    pub(super) fn harden_directory(path: &Path) -> io::Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(OWNER_ONLY))
    }

    /// Mode bits of the nearest existing ancestor
    fn inherited_mode(dir: &Path) -> io::Result<u32> {
        let existing = dir
            .ancestors()
            .find(|p| p.is_dir())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(fs::metadata(existing)?.permissions().mode() & 0o7777)
    }
}

#[cfg(windows)]
mod platform {
    use std::io;
    use std::path::Path;
    use std::process::Command;

    const ADMINISTRATORS_SID: &str = "*S-1-5-32-544";
    const SYSTEM_SID: &str = "*S-1-5-18";

    pub(super) fn reset_permissions(path: &Path, _destination_dir: &Path) -> io::Result<()> {
        icacls(path, &["/reset", "/q"])
    }

    pub(super) fn harden_directory(path: &Path) -> io::Result<()> {
        let admins = format!("{ADMINISTRATORS_SID}:(OI)(CI)F");
        let system = format!("{SYSTEM_SID}:(OI)(CI)F");
        icacls(
            path,
            &["/inheritance:r", "/grant:r", &admins, "/grant:r", &system, "/q"],
        )
    }

    fn icacls(path: &Path, args: &[&str]) -> io::Result<()> {
        let status = Command::new("icacls").arg(path).args(args).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("icacls exited with {status}")))
        }
    }
}
