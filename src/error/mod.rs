//! Error types and handling for the bootstrapper
//!
//! Uses `thiserror` for error definitions and `miette` for pretty diagnostics.
//!
//! This module is organized into sub-modules by error domain:
//! - [`config`]: Manifest, policy and command errors
//! - [`fs`]: File system errors
//! - [`cache`]: Cache engine errors
//! - [`verify`]: Artifact verification errors
//! - [`engine`]: Detect/plan/apply and elevation errors

pub mod cache;
pub mod config;
pub mod engine;
pub mod fs;
pub mod verify;


use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for bootstrapper operations
///
/// Serializable so a failure in the elevated companion reaches the primary
/// process as the same variant.
#[derive(Error, Diagnostic, Debug, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum BootstrapError {
    // Configuration errors
    #[error("Configuration file not found: {path}")]
    #[diagnostic(code(bootstrapper::config::not_found))]
    ConfigNotFound { path: String },

    #[error("Failed to read configuration file: {path}: {reason}")]
    #[diagnostic(code(bootstrapper::config::read_failed))]
    ConfigReadFailed { path: String, reason: String },

    #[error("Failed to parse configuration file: {path}: {reason}")]
    #[diagnostic(code(bootstrapper::config::parse_failed))]
    ConfigParseFailed { path: String, reason: String },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(
        code(bootstrapper::config::invalid),
        help("Check that every package, payload and container reference in the manifest exists")
    )]
    ConfigInvalid { message: String },

    // File system errors
    #[error("File not found: {path}")]
    #[diagnostic(code(bootstrapper::fs::not_found))]
    FileNotFound { path: String },

    #[error("Failed to read file: {path}: {reason}")]
    #[diagnostic(code(bootstrapper::fs::read_failed))]
    FileReadFailed { path: String, reason: String },

    #[error("Failed to write file: {path}: {reason}")]
    #[diagnostic(code(bootstrapper::fs::write_failed))]
    FileWriteFailed { path: String, reason: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(bootstrapper::fs::io_error))]
    IoError { message: String },

    #[error("{operation} failed for {path} after {attempts} attempts: {reason}")]
    #[diagnostic(
        code(bootstrapper::fs::retries_exhausted),
        help("Another process may be holding the file open; close it and try again")
    )]
    RetriesExhausted {
        operation: String,
        path: String,
        attempts: u32,
        reason: String,
    },

    // Cache errors
    #[error("Cache operation failed: {message}")]
    #[diagnostic(code(bootstrapper::cache::operation_failed))]
    CacheOperationFailed { message: String },

    #[error("Could not resolve known folder: {folder}")]
    #[diagnostic(code(bootstrapper::cache::known_folder))]
    KnownFolderUnavailable { folder: String },

    #[error("No usable working folder; tried: {candidates}")]
    #[diagnostic(
        code(bootstrapper::cache::no_working_folder),
        help("Set engine_working_directory in the machine policy or pass --working-dir")
    )]
    NoUsableWorkingFolder { candidates: String },

    #[error("Source for '{id}' not found; searched: {searched}")]
    #[diagnostic(
        code(bootstrapper::cache::source_not_found),
        help("Run the bootstrapper from the folder containing its payloads, or set a download URL")
    )]
    SourceNotFound { id: String, searched: String },

    #[error("Failed to download {url}: {reason}")]
    #[diagnostic(code(bootstrapper::cache::download_failed))]
    DownloadFailed { url: String, reason: String },

    // Verification errors
    #[error("Hash mismatch for '{id}': expected {expected}, actual {actual}")]
    #[diagnostic(
        code(bootstrapper::verify::hash_mismatch),
        help("The file is corrupt or was tampered with; it has been removed and will be acquired again")
    )]
    HashMismatch {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Size mismatch for '{id}': expected {expected} bytes, actual {actual} bytes")]
    #[diagnostic(code(bootstrapper::verify::size_mismatch))]
    SizeMismatch { id: String, expected: u64, actual: u64 },

    #[error("Signature of '{id}' is not trusted: {reason}")]
    #[diagnostic(code(bootstrapper::verify::untrusted))]
    SignatureUntrusted { id: String, reason: String },

    // Engine errors
    #[error("Precondition failed: {message}")]
    #[diagnostic(code(bootstrapper::engine::precondition))]
    PreconditionFailed { message: String },

    #[error("Operation canceled by user")]
    #[diagnostic(code(bootstrapper::engine::user_exit))]
    UserExit,

    #[error("No package engine registered for '{package}' ({kind})")]
    #[diagnostic(
        code(bootstrapper::engine::package_engine_missing),
        help("This package format cannot be executed on the current platform")
    )]
    PackageEngineMissing { package: String, kind: String },

    #[error("Package '{package}' failed: {reason}")]
    #[diagnostic(code(bootstrapper::engine::package_failed))]
    PackageFailed { package: String, reason: String },

    #[error("Failed to acquire the apply lock: {reason}")]
    #[diagnostic(code(bootstrapper::engine::apply_lock))]
    ApplyLockFailed { reason: String },

    // Elevation errors
    #[error("Elevation failed: {reason}")]
    #[diagnostic(
        code(bootstrapper::elevation::failed),
        help("Per-machine packages require administrative privileges")
    )]
    ElevationFailed { reason: String },

    #[error("Elevated process was interrupted: {reason}")]
    #[diagnostic(
        code(bootstrapper::elevation::interrupted),
        help("Security software may have blocked the elevated process")
    )]
    ElevationInterrupted { reason: String },

    #[error("Elevated channel error: {message}")]
    #[diagnostic(code(bootstrapper::elevation::protocol))]
    ElevationProtocol { message: String },
}

impl BootstrapError {
    /// Whether this error means a cached artifact failed verification
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Self::HashMismatch { .. } | Self::SizeMismatch { .. } | Self::SignatureUntrusted { .. }
        )
    }

    /// Whether this error is the distinguished cancellation status
    pub fn is_user_exit(&self) -> bool {
        matches!(self, Self::UserExit)
    }
}

impl From<std::io::Error> for BootstrapError {
    fn from(err: std::io::Error) -> Self {
        BootstrapError::IoError {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for BootstrapError {
    fn from(err: serde_yaml::Error) -> Self {
        BootstrapError::ConfigParseFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for BootstrapError {
    fn from(err: serde_json::Error) -> Self {
        BootstrapError::ConfigParseFailed {
            path: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Result type alias using miette for error handling
pub type Result<T> = miette::Result<T, BootstrapError>;
