//! Configuration handling for the bootstrapper
//!
//! This module contains data structures for:
//! - `bundle.yaml` - The bundle manifest (packages, payloads, containers)
//! - `policy.yaml` - Machine policy (cache redirection, working folder, elevation)
//! - The engine command assembled from the command line

pub mod command;
pub mod manifest;
pub mod policy;

// Re-export commonly used types
pub use command::{BundleAction, EngineCommand};
pub use manifest::{ApprovedExe, Manifest, UpdateSource};
pub use policy::{MachinePolicy, RetrySettings};
