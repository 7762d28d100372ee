//! Domain models for the bootstrapper
//!
//! This module contains the static bundle model read from the manifest
//! (registration, containers, payloads, packages, rollback boundaries) together
//! with the per-run state that Detect and Plan record on packages.

pub mod container;
pub mod package;
pub mod payload;
pub mod registration;

pub use container::Container;
pub use package::{
    ActionState, CacheType, DetectCondition, EXIT_RESTART_INITIATED, EXIT_RESTART_REQUIRED,
    Package, PackageKind, PackageState, RequestState, RestartExitCodes, RollbackBoundary,
    exit_status,
};
pub use payload::{Payload, Verification};
pub use registration::{RegistrationInfo, RegistrationRecord, RelatedBundle, RelationType};
