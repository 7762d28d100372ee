//! Package domain types
//!
//! A package is one installable unit inside a bundle. The authored fields come
//! from the manifest; the remaining fields are per-run state written by Detect
//! (`current_state`, `cached`) and Plan (`requested`, `execute`, `rollback`,
//! cache decisions) and consumed by Apply.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::BundleAction;

/// Installer format of a package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    Exe,
    Bundle,
    Msi,
    Msp,
    Msu,
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PackageKind::Exe => "exe",
            PackageKind::Bundle => "bundle",
            PackageKind::Msi => "msi",
            PackageKind::Msp => "msp",
            PackageKind::Msu => "msu",
        };
        f.write_str(name)
    }
}

/// Authored cache policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    /// Remove the cached payloads once the package is installed
    Remove,
    /// Keep the cached payloads while the package is installed
    #[default]
    Keep,
    /// Always cache, even when nothing is executed
    Force,
}

/// Detected state of a package on the machine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    #[default]
    Unknown,
    Absent,
    Present,
    Superseded,
    Obsolete,
}

/// State the plan asks a package to reach
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    #[default]
    None,
    ForceAbsent,
    Absent,
    Cache,
    Present,
    ForcePresent,
    Repair,
}

/// Action executed for a package during apply or rollback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    #[default]
    None,
    Install,
    Uninstall,
    Repair,
    Modify,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionState::None => "none",
            ActionState::Install => "install",
            ActionState::Uninstall => "uninstall",
            ActionState::Repair => "repair",
            ActionState::Modify => "modify",
        };
        f.pad(name)
    }
}

/// Truncate an exit code the way the platform reports process statuses.
/// Unix keeps only the low 8 bits, so 3010 is seen as 194.
pub const fn exit_status(code: i32) -> i32 {
    if cfg!(windows) {
        code
    } else {
        code & 0xff
    }
}

/// Exit code meaning "succeeded, restart required"
pub const EXIT_RESTART_REQUIRED: i32 = exit_status(3010);
/// Exit code meaning "succeeded, restart already initiated"
pub const EXIT_RESTART_INITIATED: i32 = exit_status(1641);

/// Exit codes a package uses to report a restart. Authored codes are
/// compared after [`exit_status`] truncation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartExitCodes {
    pub required: Vec<i32>,
    pub initiated: Vec<i32>,
}

impl Default for RestartExitCodes {
    fn default() -> Self {
        Self {
            required: vec![EXIT_RESTART_REQUIRED],
            initiated: vec![EXIT_RESTART_INITIATED],
        }
    }
}

impl RestartExitCodes {
    pub fn is_required(&self, status: i32) -> bool {
        self.required.iter().any(|&c| exit_status(c) == status)
    }

    pub fn is_initiated(&self, status: i32) -> bool {
        self.initiated.iter().any(|&c| exit_status(c) == status)
    }
}

/// Condition deciding whether a package is present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DetectCondition {
    /// Present when the path exists; `[Variable]` references are expanded
    PathExists { path: String },
    /// Present when the variable is set to a truthy value
    Variable { name: String },
}

/// A group of packages that commit or roll back together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackBoundary {
    pub id: String,

    /// A failure inside a vital boundary fails the whole apply
    #[serde(default = "default_true")]
    pub vital: bool,

    #[serde(default)]
    pub transaction: bool,
}

fn default_true() -> bool {
    true
}

/// An installable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub kind: PackageKind,

    /// Directory name under the cache root
    pub cache_id: String,

    #[serde(default)]
    pub per_machine: bool,

    #[serde(default = "default_true")]
    pub vital: bool,

    /// Permanent packages are never uninstalled
    #[serde(default)]
    pub permanent: bool,

    #[serde(default)]
    pub cache: CacheType,

    /// Payload keys, in order
    pub payloads: Vec<String>,

    /// Boundary that begins at this package
    #[serde(default)]
    pub rollback_boundary: Option<String>,

    #[serde(default)]
    pub install_arguments: Vec<String>,

    #[serde(default)]
    pub repair_arguments: Option<Vec<String>>,

    #[serde(default)]
    pub uninstall_arguments: Option<Vec<String>>,

    #[serde(default)]
    pub detect: Option<DetectCondition>,

    /// Payload key launched by the exe engine (defaults to the first payload)
    #[serde(default)]
    pub executable: Option<String>,

    #[serde(default)]
    pub restart_exit_codes: RestartExitCodes,

    #[serde(skip)]
    pub current_state: PackageState,
    #[serde(skip)]
    pub cached: bool,
    #[serde(skip)]
    pub requested: RequestState,
    #[serde(skip)]
    pub execute: ActionState,
    #[serde(skip)]
    pub rollback: ActionState,
    #[serde(skip)]
    pub cache_requested: bool,
    #[serde(skip)]
    pub uncache_after_apply: bool,
}

impl Package {
    /// Clear everything Detect records
    pub fn reset_detect(&mut self) {
        self.current_state = PackageState::Unknown;
        self.cached = false;
    }

    /// Clear everything Plan records
    pub fn reset_plan(&mut self) {
        self.requested = RequestState::None;
        self.execute = ActionState::None;
        self.rollback = ActionState::None;
        self.cache_requested = false;
        self.uncache_after_apply = false;
    }

    pub fn is_uninstallable(&self) -> bool {
        !self.permanent && self.uninstall_arguments.is_some()
    }

    pub fn is_repairable(&self) -> bool {
        self.repair_arguments.is_some()
    }

    /// Requested state recommended for a bundle-level action
    pub fn default_request(&self, action: BundleAction) -> RequestState {
        match action {
            BundleAction::Install | BundleAction::UpdateReplace => {
                if matches!(
                    self.current_state,
                    PackageState::Superseded | PackageState::Obsolete
                ) {
                    RequestState::None
                } else {
                    RequestState::Present
                }
            }
            BundleAction::Modify => RequestState::Present,
            BundleAction::Repair => {
                if self.is_repairable() {
                    RequestState::Repair
                } else {
                    RequestState::ForcePresent
                }
            }
            BundleAction::Uninstall => {
                if self.permanent {
                    RequestState::None
                } else {
                    RequestState::Absent
                }
            }
            BundleAction::Cache | BundleAction::Layout => RequestState::Cache,
            BundleAction::Detect => RequestState::None,
        }
    }

    /// Derive execute/rollback actions and cache decisions from the detected and
    /// requested state
    pub fn calculate_actions(&mut self) {
        let (execute, rollback) = match (self.current_state, self.requested) {
            (_, RequestState::None | RequestState::Cache) => (ActionState::None, ActionState::None),
            (PackageState::Present, RequestState::Present) => (ActionState::None, ActionState::None),
            (PackageState::Present, RequestState::ForcePresent | RequestState::Repair) => {
                (ActionState::Repair, ActionState::None)
            }
            (
                PackageState::Present | PackageState::Superseded | PackageState::Obsolete,
                RequestState::Absent | RequestState::ForceAbsent,
            ) => {
                if self.is_uninstallable() {
                    (ActionState::Uninstall, ActionState::Install)
                } else {
                    (ActionState::None, ActionState::None)
                }
            }
            (PackageState::Superseded | PackageState::Obsolete, _) => {
                (ActionState::None, ActionState::None)
            }
            (
                PackageState::Absent | PackageState::Unknown,
                RequestState::Present | RequestState::ForcePresent | RequestState::Repair,
            ) => {
                let rollback = if self.is_uninstallable() {
                    ActionState::Uninstall
                } else {
                    ActionState::None
                };
                (ActionState::Install, rollback)
            }
            (PackageState::Absent | PackageState::Unknown, _) => {
                (ActionState::None, ActionState::None)
            }
        };

        self.execute = execute;
        self.rollback = rollback;

        // Every action, uninstall included, runs the package from its cached payloads.
        self.cache_requested = execute != ActionState::None
            || self.requested == RequestState::Cache
            || (self.cache == CacheType::Force && self.requested != RequestState::Absent);

        self.uncache_after_apply = match execute {
            ActionState::Uninstall => true,
            ActionState::Install | ActionState::Repair => self.cache == CacheType::Remove,
            ActionState::None | ActionState::Modify => {
                self.cached
                    && self.cache != CacheType::Force
                    && matches!(self.current_state, PackageState::Absent)
                    && self.requested == RequestState::None
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(state: PackageState) -> Package {
        let yaml = r"
id: app
kind: exe
cache_id: app-1.0
payloads: [app.exe]
uninstall_arguments: [--uninstall]
";
        let mut package: Package = serde_yaml::from_str(yaml).unwrap();
        package.current_state = state;
        package
    }

    #[test]
    fn test_restart_exit_codes() {
        let p = package(PackageState::Absent);
        assert!(p.restart_exit_codes.is_required(EXIT_RESTART_REQUIRED));
        assert!(p.restart_exit_codes.is_initiated(EXIT_RESTART_INITIATED));
        assert!(!p.restart_exit_codes.is_required(0));
        if cfg!(unix) {
            assert_eq!(EXIT_RESTART_REQUIRED, 194);
            assert_eq!(EXIT_RESTART_INITIATED, 105);
        }

        let yaml = "
id: driver
kind: exe
cache_id: driver-1
payloads: [driver.sh]
restart_exit_codes: { required: [20, 3010] }
";
        let p: Package = serde_yaml::from_str(yaml).unwrap();
        assert!(p.restart_exit_codes.is_required(20));
        assert!(p.restart_exit_codes.is_required(exit_status(3010)));
        assert_eq!(p.restart_exit_codes.initiated, vec![EXIT_RESTART_INITIATED]);
    }

    #[test]
    fn test_install_absent_package() {
        let mut p = package(PackageState::Absent);
        p.requested = p.default_request(BundleAction::Install);
        p.calculate_actions();
        assert_eq!(p.execute, ActionState::Install);
        assert_eq!(p.rollback, ActionState::Uninstall);
        assert!(p.cache_requested);
        assert!(!p.uncache_after_apply);
    }

    #[test]
    fn test_install_present_package_is_noop() {
        let mut p = package(PackageState::Present);
        p.requested = p.default_request(BundleAction::Install);
        p.calculate_actions();
        assert_eq!(p.execute, ActionState::None);
        assert!(!p.cache_requested);
    }

    #[test]
    fn test_uninstall_removes_from_cache() {
        let mut p = package(PackageState::Present);
        p.requested = p.default_request(BundleAction::Uninstall);
        p.calculate_actions();
        assert_eq!(p.execute, ActionState::Uninstall);
        assert_eq!(p.rollback, ActionState::Install);
        assert!(p.cache_requested);
        assert!(p.uncache_after_apply);
    }

    #[test]
    fn test_permanent_package_is_not_uninstalled() {
        let mut p = package(PackageState::Present);
        p.permanent = true;
        p.requested = p.default_request(BundleAction::Uninstall);
        p.calculate_actions();
        assert_eq!(p.execute, ActionState::None);
    }

    #[test]
    fn test_cache_type_remove_uncaches_after_install() {
        let mut p = package(PackageState::Absent);
        p.cache = CacheType::Remove;
        p.requested = RequestState::Present;
        p.calculate_actions();
        assert!(p.cache_requested);
        assert!(p.uncache_after_apply);
    }

    #[test]
    fn test_force_cache_without_execution() {
        let mut p = package(PackageState::Present);
        p.cache = CacheType::Force;
        p.requested = RequestState::Present;
        p.calculate_actions();
        assert_eq!(p.execute, ActionState::None);
        assert!(p.cache_requested);
    }

    #[test]
    fn test_repair_without_repair_arguments_forces_present() {
        let p = package(PackageState::Present);
        assert_eq!(p.default_request(BundleAction::Repair), RequestState::ForcePresent);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut p = package(PackageState::Present);
        p.cached = true;
        p.requested = RequestState::Present;
        p.execute = ActionState::Install;
        p.reset_detect();
        p.reset_plan();
        assert_eq!(p.current_state, PackageState::Unknown);
        assert!(!p.cached);
        assert_eq!(p.execute, ActionState::None);
    }
}
