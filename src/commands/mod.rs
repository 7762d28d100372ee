//! Command implementations for the bootstrapper CLI

pub mod apply;
pub mod cache;
pub mod companion;
pub mod completions;
pub mod version;
