//! File system errors

use std::path::Path;

use super::BootstrapError;

/// Creates a file not found error
pub fn not_found(path: &Path) -> BootstrapError {
    BootstrapError::FileNotFound {
        path: path.display().to_string(),
    }
}

/// Creates a file read failed error
pub fn read_failed(path: &Path, err: &std::io::Error) -> BootstrapError {
    BootstrapError::FileReadFailed {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Creates a file write failed error
pub fn write_failed(path: &Path, err: &std::io::Error) -> BootstrapError {
    BootstrapError::FileWriteFailed {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

/// Creates an IO error
pub fn io_error(message: impl Into<String>) -> BootstrapError {
    BootstrapError::IoError {
        message: message.into(),
    }
}

/// Creates a retries exhausted error carrying the last underlying failure
pub fn retries_exhausted(
    operation: impl Into<String>,
    path: &Path,
    attempts: u32,
    last: &std::io::Error,
) -> BootstrapError {
    BootstrapError::RetriesExhausted {
        operation: operation.into(),
        path: path.display().to_string(),
        attempts,
        reason: last.to_string(),
    }
}
