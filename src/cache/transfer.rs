//! Transfer engine
//!
//! Moves or copies artifacts between the working folder, the unverified
//! staging area and their final destinations. Each attempt is all-or-nothing:
//! a copy lands in a temporary file beside the destination and is renamed
//! into place only once complete.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::{BootstrapError, Result, fs::not_found, fs::retries_exhausted};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Carried inside an `io::Error` when a progress callback asks to stop
#[derive(Debug)]
pub struct Canceled;

impl fmt::Display for Canceled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("canceled")
    }
}

impl std::error::Error for Canceled {}

/// The error a progress callback returns to stop a transfer
pub fn canceled() -> io::Error {
    io::Error::other(Canceled)
}

pub(crate) fn is_canceled(err: &io::Error) -> bool {
    err.get_ref().is_some_and(|inner| inner.is::<Canceled>())
}

/// Bounded retry for transient file system failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        Self {
            attempts: settings.attempts.max(1),
            delay: settings.delay(),
        }
    }
}

impl RetryPolicy {
    /// A policy that retries quickly, for tests
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            delay: Duration::ZERO,
        }
    }

    /// Run `f` until it succeeds or the attempts are used up.
    ///
    /// `NotFound` is never retried and surfaces as `FileNotFound` so callers can
    /// tolerate an artifact that is already gone. A [`Canceled`] error surfaces
    /// as `UserExit`.
    pub fn run<T>(
        &self,
        operation: &str,
        path: &Path,
        mut f: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;

        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) if is_canceled(&e) => return Err(BootstrapError::UserExit),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(path)),
                Err(e) if attempt >= attempts => {
                    return Err(retries_exhausted(operation, path, attempts, &e));
                }
                Err(e) => {
                    warn!(
                        operation,
                        path = %path.display(),
                        attempt,
                        error = %e,
                        "transient failure, retrying"
                    );
                    attempt += 1;
                    thread::sleep(self.delay);
                }
            }
        }
    }
}

/// How an artifact leaves its source location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Move,
    Copy,
}

/// Transfer `source` to `destination`, replacing any existing file.
///
/// `on_progress` receives the running byte count while copying. Returns the
/// number of bytes transferred.
pub fn transfer_file(
    source: &Path,
    destination: &Path,
    mode: TransferMode,
    retry: &RetryPolicy,
    on_progress: &mut dyn FnMut(u64) -> io::Result<()>,
) -> Result<u64> {
    if let Some(parent) = destination.parent() {
        retry.run("create directory", parent, || fs::create_dir_all(parent))?;
    }

    let operation = match mode {
        TransferMode::Move => "move",
        TransferMode::Copy => "copy",
    };

    let bytes = retry.run(operation, source, || match mode {
        TransferMode::Move => move_file(source, destination, &mut *on_progress),
        TransferMode::Copy => copy_file(source, destination, &mut *on_progress),
    })?;

    debug!(
        source = %source.display(),
        destination = %destination.display(),
        operation,
        bytes,
        "transferred"
    );
    Ok(bytes)
}

fn move_file(
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64) -> io::Result<()>,
) -> io::Result<u64> {
    let size = fs::metadata(source)?.len();

    match fs::rename(source, destination) {
        Ok(()) => {
            on_progress(size)?;
            Ok(size)
        }
        // Rename fails across devices; fall back to copy then delete.
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            debug!(error = %e, "rename failed, copying instead");
            let bytes = copy_file(source, destination, on_progress)?;
            fs::remove_file(source)?;
            Ok(bytes)
        }
        Err(e) => Err(e),
    }
}

fn copy_file(
    source: &Path,
    destination: &Path,
    on_progress: &mut dyn FnMut(u64) -> io::Result<()>,
) -> io::Result<u64> {
    let dir = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut reader = fs::File::open(source)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    let bytes = copy_with_progress(&mut reader, staged.as_file_mut(), on_progress)?;
    staged.as_file().sync_all()?;
    staged.persist(destination).map_err(|e| e.error)?;
    Ok(bytes)
}

/// Copy a stream in chunks, reporting the running total after each chunk
pub fn copy_with_progress(
    reader: &mut dyn Read,
    writer: &mut dyn Write,
    on_progress: &mut dyn FnMut(u64) -> io::Result<()>,
) -> io::Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buffer[..read])?;
        total += read as u64;
        on_progress(total)?;
    }

    writer.flush()?;
    Ok(total)
}

/// Remove a directory tree with retry, treating "already gone" as success
pub fn remove_dir_all_with_retry(path: &Path, retry: &RetryPolicy) -> Result<()> {
    match retry.run("remove directory", path, || fs::remove_dir_all(path)) {
        Err(BootstrapError::FileNotFound { .. }) => Ok(()),
        other => other,
    }
}

/// Remove a file with retry, treating "already gone" as success
pub fn remove_file_with_retry(path: &Path, retry: &RetryPolicy) -> Result<()> {
    match retry.run("remove file", path, || fs::remove_file(path)) {
        Err(BootstrapError::FileNotFound { .. }) => Ok(()),
        other => other,
    }
}
