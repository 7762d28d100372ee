//! Bundle registration and related-bundle types

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::{ActionState, RequestState};
use crate::error::{Result, config::invalid};

/// How another registered bundle relates to this one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    #[default]
    None,
    Detect,
    Upgrade,
    Addon,
    Patch,
    Dependent,
    Update,
}

impl RelationType {
    /// Add-ons and patches depend on their parent and are ordered ahead of it
    pub fn is_dependent_child(self) -> bool {
        matches!(self, RelationType::Addon | RelationType::Patch)
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RelationType::None => "none",
            RelationType::Detect => "detect",
            RelationType::Upgrade => "upgrade",
            RelationType::Addon => "addon",
            RelationType::Patch => "patch",
            RelationType::Dependent => "dependent",
            RelationType::Update => "update",
        };
        f.write_str(name)
    }
}

/// Identity of the bundle being run, from the manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub id: String,
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub upgrade_code: Option<String>,

    #[serde(default)]
    pub per_machine: bool,

    pub cache_id: String,

    #[serde(default = "default_executable_name")]
    pub executable_name: String,

    /// Upgrade codes of bundles this bundle is an add-on for
    #[serde(default)]
    pub addon_for: Vec<String>,

    /// Upgrade codes of bundles this bundle patches
    #[serde(default)]
    pub patch_for: Vec<String>,

    /// Upgrade codes of bundles that are only detected
    #[serde(default)]
    pub detect_codes: Vec<String>,
}

fn default_executable_name() -> String {
    "setup".to_string()
}

impl RegistrationInfo {
    pub fn parsed_version(&self) -> Result<semver::Version> {
        semver::Version::parse(&self.version)
            .map_err(|e| invalid(format!("bundle version '{}': {e}", self.version)))
    }
}

/// What a registered bundle leaves behind for others to discover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub upgrade_code: Option<String>,
    pub per_machine: bool,
    pub cache_id: String,
    pub executable_name: String,
    #[serde(default)]
    pub addon_for: Vec<String>,
    #[serde(default)]
    pub patch_for: Vec<String>,
}

impl From<&RegistrationInfo> for RegistrationRecord {
    fn from(info: &RegistrationInfo) -> Self {
        Self {
            id: info.id.clone(),
            name: info.name.clone(),
            version: info.version.clone(),
            upgrade_code: info.upgrade_code.clone(),
            per_machine: info.per_machine,
            cache_id: info.cache_id.clone(),
            executable_name: info.executable_name.clone(),
            addon_for: info.addon_for.clone(),
            patch_for: info.patch_for.clone(),
        }
    }
}

/// Another bundle found on the machine during Detect
#[derive(Debug, Clone)]
pub struct RelatedBundle {
    pub record: RegistrationRecord,
    pub relation: RelationType,
    pub version: semver::Version,
    pub requested: RequestState,
    pub execute: ActionState,
    pub rollback: ActionState,
}

impl RelatedBundle {
    pub fn new(record: RegistrationRecord, relation: RelationType, version: semver::Version) -> Self {
        Self {
            record,
            relation,
            version,
            requested: RequestState::None,
            execute: ActionState::None,
            rollback: ActionState::None,
        }
    }

    /// Relation of `record` to `ours`, if any
    pub fn relation_of(ours: &RegistrationInfo, record: &RegistrationRecord) -> RelationType {
        if record.id == ours.id {
            return RelationType::None;
        }

        let Some(their_code) = record.upgrade_code.as_deref() else {
            return RelationType::None;
        };

        if let Some(our_code) = ours.upgrade_code.as_deref() {
            if record.addon_for.iter().any(|c| c == our_code) {
                return RelationType::Addon;
            }
            if record.patch_for.iter().any(|c| c == our_code) {
                return RelationType::Patch;
            }
            if our_code == their_code {
                return RelationType::Upgrade;
            }
        }

        if ours.addon_for.iter().any(|c| c == their_code)
            || ours.patch_for.iter().any(|c| c == their_code)
        {
            return RelationType::Dependent;
        }

        if ours.detect_codes.iter().any(|c| c == their_code) {
            return RelationType::Detect;
        }

        RelationType::None
    }
}
