//! Cache errors

use super::BootstrapError;

/// Creates a cache operation failed error
pub fn operation_failed(message: impl Into<String>) -> BootstrapError {
    BootstrapError::CacheOperationFailed {
        message: message.into(),
    }
}

/// Creates a source not found error listing every searched location
pub fn source_not_found(id: impl Into<String>, searched: &[std::path::PathBuf]) -> BootstrapError {
    BootstrapError::SourceNotFound {
        id: id.into(),
        searched: searched
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Creates a download failed error
pub fn download_failed(url: impl Into<String>, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::DownloadFailed {
        url: url.into(),
        reason: reason.into(),
    }
}
