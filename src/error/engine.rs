//! Engine and elevation errors

use super::BootstrapError;

/// Creates a precondition failed error
pub fn precondition(message: impl Into<String>) -> BootstrapError {
    BootstrapError::PreconditionFailed {
        message: message.into(),
    }
}

/// Creates a package failed error
pub fn package_failed(package: impl Into<String>, reason: impl Into<String>) -> BootstrapError {
    BootstrapError::PackageFailed {
        package: package.into(),
        reason: reason.into(),
    }
}

/// Creates an elevation failed error
pub fn elevation_failed(reason: impl Into<String>) -> BootstrapError {
    BootstrapError::ElevationFailed {
        reason: reason.into(),
    }
}

/// Creates an elevated channel protocol error
pub fn protocol(message: impl Into<String>) -> BootstrapError {
    BootstrapError::ElevationProtocol {
        message: message.into(),
    }
}
