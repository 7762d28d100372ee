//! Bootstrapper - installation bundle engine
//!
//! Detects what a bundle's packages look like on this machine, plans the
//! actions for a requested operation, then caches, verifies and executes
//! them with rollback. Per-machine work runs in an elevated companion
//! process.

pub mod cache;
pub mod cli;
pub mod commands;
pub mod config;
pub mod domain;
pub mod elevation;
pub mod engine;
pub mod error;
pub mod events;
pub mod hash;
pub mod packages;
pub mod temp;
pub mod variables;

pub use engine::Engine;
pub use error::{BootstrapError, Result};
