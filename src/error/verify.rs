//! Verification errors

use super::BootstrapError;

/// Creates a hash mismatch error
pub fn hash_mismatch(
    id: impl Into<String>,
    expected: impl Into<String>,
    actual: impl Into<String>,
) -> BootstrapError {
    BootstrapError::HashMismatch {
        id: id.into(),
        expected: expected.into(),
        actual: actual.into(),
    }
}

/// Creates a size mismatch error
pub fn size_mismatch(id: impl Into<String>, expected: u64, actual: u64) -> BootstrapError {
    BootstrapError::SizeMismatch {
        id: id.into(),
        expected,
        actual,
    }
}

/// Creates an untrusted signature error
pub fn untrusted(id: impl Into<String>, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::SignatureUntrusted {
        id: id.into(),
        reason: reason.into(),
    }
}
