//! Engine command: what this run was asked to do

use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::RelationType;

/// Top-level action requested for the bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BundleAction {
    /// Only detect current state
    Detect,
    /// Copy the bundle and all payloads to a layout directory
    Layout,
    /// Cache payloads without executing anything
    Cache,
    #[default]
    Install,
    Modify,
    Repair,
    Uninstall,
    /// Replace this bundle with a newer one
    UpdateReplace,
}

impl BundleAction {
    /// Whether applying this action can change installed machine state
    pub fn affects_machine_state(self) -> bool {
        !matches!(self, BundleAction::Detect | BundleAction::Layout)
    }
}

impl fmt::Display for BundleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BundleAction::Detect => "detect",
            BundleAction::Layout => "layout",
            BundleAction::Cache => "cache",
            BundleAction::Install => "install",
            BundleAction::Modify => "modify",
            BundleAction::Repair => "repair",
            BundleAction::Uninstall => "uninstall",
            BundleAction::UpdateReplace => "update-replace",
        };
        f.write_str(name)
    }
}

/// Options for one engine run
#[derive(Debug, Clone, Default)]
pub struct EngineCommand {
    pub action: BundleAction,

    /// Destination for `Layout`
    pub layout_directory: Option<PathBuf>,

    /// Explicit base directory for the working folder
    pub working_directory: Option<PathBuf>,

    /// Cache and execute concurrently instead of caching everything first
    pub parallel_cache: bool,

    pub disable_rollback: bool,

    /// Relation this bundle was launched with by a related bundle
    pub relation_type: RelationType,

    /// Path of the running engine binary; defaults to the current executable
    pub engine_path: Option<PathBuf>,

    /// Original process path when relaunched from a clean room
    pub source_process: Option<PathBuf>,
}

impl EngineCommand {
    pub fn new(action: BundleAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }
}
