//! Package engines
//!
//! Each installer format is handled by a [`PackageEngine`] registered for its
//! [`PackageKind`]. The orchestrator only knows this contract:
//!
//! - `detect`: current state of the package on the machine
//! - `plan`: derive execute/rollback actions from detected and requested state
//! - `execute`: run one action from the package's cached payloads
//!
//! Exe and bundle packages have engines on every platform. MSI, MSP and MSU
//! packages have none here, so planning one for execution fails with
//! `PackageEngineMissing`.

pub mod bundle;
pub mod exe;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::Cache;
use crate::config::Manifest;
use crate::domain::{
    ActionState, DetectCondition, Package, PackageKind, PackageState, RestartExitCodes,
};
use crate::error::{BootstrapError, Result, engine::package_failed};
use crate::variables::Variables;

pub use bundle::BundleEngine;
pub use exe::ExeEngine;

pub use crate::domain::{EXIT_RESTART_INITIATED, EXIT_RESTART_REQUIRED, exit_status};

/// Restart outcome of executing a package; ordered by severity
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Restart {
    #[default]
    None,
    Required,
    Initiated,
}

impl fmt::Display for Restart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Restart::None => "none",
            Restart::Required => "required",
            Restart::Initiated => "initiated",
        };
        f.write_str(name)
    }
}

/// What a package engine may read while detecting or executing
#[derive(Clone, Copy)]
pub struct PackageContext<'a> {
    pub manifest: &'a Manifest,
    pub cache: &'a Cache,
    pub variables: &'a Variables,
}

impl PackageContext<'_> {
    /// Completed cache path of the payload a package launches
    pub fn executable_path(&self, package: &Package) -> Result<PathBuf> {
        let key = package
            .executable
            .as_deref()
            .or_else(|| package.payloads.first().map(String::as_str))
            .ok_or_else(|| package_failed(&package.id, "package has no payloads"))?;
        let payload = self
            .manifest
            .payload(key)
            .ok_or_else(|| package_failed(&package.id, format!("unknown payload '{key}'")))?;

        Ok(self
            .cache
            .completed_path(package.per_machine, &package.cache_id)
            .path
            .join(&payload.file_path))
    }
}

/// Format-specific detection, planning and execution
pub trait PackageEngine: Send + Sync {
    fn detect(&self, package: &Package, context: &PackageContext<'_>) -> Result<PackageState>;

    fn plan(&self, package: &mut Package) -> Result<()> {
        package.calculate_actions();
        Ok(())
    }

    /// Run `action`. `progress` receives a percentage and returns an error to cancel.
    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        context: &PackageContext<'_>,
        progress: &mut dyn FnMut(u8) -> Result<()>,
    ) -> Result<Restart>;
}

/// Package engines keyed by installer format
pub struct PackageEngines {
    engines: HashMap<PackageKind, Box<dyn PackageEngine>>,
}

impl PackageEngines {
    pub fn empty() -> Self {
        Self {
            engines: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: PackageKind, engine: Box<dyn PackageEngine>) {
        self.engines.insert(kind, engine);
    }

    /// Engine for `package`, or `PackageEngineMissing`
    pub fn get(&self, package: &Package) -> Result<&dyn PackageEngine> {
        self.engines
            .get(&package.kind)
            .map(|engine| &**engine)
            .ok_or_else(|| BootstrapError::PackageEngineMissing {
                package: package.id.clone(),
                kind: package.kind.to_string(),
            })
    }

    pub fn supports(&self, kind: PackageKind) -> bool {
        self.engines.contains_key(&kind)
    }
}

impl Default for PackageEngines {
    /// Engines available on every platform
    fn default() -> Self {
        let mut engines = Self::empty();
        engines.register(PackageKind::Exe, Box::new(ExeEngine));
        engines.register(PackageKind::Bundle, Box::new(BundleEngine));
        engines
    }
}

/// Evaluate an authored detect condition
pub fn evaluate_condition(condition: &DetectCondition, variables: &Variables) -> PackageState {
    let present = match condition {
        DetectCondition::PathExists { path } => {
            std::path::Path::new(&variables.expand(path)).exists()
        }
        DetectCondition::Variable { name } => variables.get_bool(name),
    };
    if present {
        PackageState::Present
    } else {
        PackageState::Absent
    }
}

/// Map a process exit code to a restart outcome
pub fn restart_for_exit(
    package_id: &str,
    code: Option<i32>,
    codes: &RestartExitCodes,
) -> Result<Restart> {
    match code {
        Some(0) => Ok(Restart::None),
        Some(code) if codes.is_required(code) => Ok(Restart::Required),
        Some(code) if codes.is_initiated(code) => Ok(Restart::Initiated),
        Some(code) => Err(package_failed(package_id, format!("exited with code {code}"))),
        None => Err(package_failed(package_id, "terminated by a signal")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let codes = RestartExitCodes::default();
        assert_eq!(restart_for_exit("p", Some(0), &codes).unwrap(), Restart::None);
        assert_eq!(
            restart_for_exit("p", Some(exit_status(3010)), &codes).unwrap(),
            Restart::Required
        );
        assert_eq!(
            restart_for_exit("p", Some(exit_status(1641)), &codes).unwrap(),
            Restart::Initiated
        );

        let err = restart_for_exit("p", Some(2), &codes).unwrap_err();
        assert!(err.to_string().contains("exited with code 2"));
        assert!(restart_for_exit("p", None, &codes).is_err());
    }

    #[test]
    fn test_authored_restart_codes() {
        let codes = RestartExitCodes {
            required: vec![20],
            initiated: vec![21],
        };
        assert_eq!(restart_for_exit("p", Some(20), &codes).unwrap(), Restart::Required);
        assert_eq!(restart_for_exit("p", Some(21), &codes).unwrap(), Restart::Initiated);
        assert!(restart_for_exit("p", Some(EXIT_RESTART_REQUIRED), &codes).is_err());
    }

    #[test]
    fn test_restart_severity_order() {
        assert_eq!(Restart::None.max(Restart::Required), Restart::Required);
        assert_eq!(Restart::Initiated.max(Restart::Required), Restart::Initiated);
    }

    #[test]
    fn test_conditions() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut variables = Variables::new();
        variables.set("Root", temp.path().display().to_string());
        variables.set_bool("Installed", true);

        assert_eq!(
            evaluate_condition(
                &DetectCondition::PathExists {
                    path: "[Root]".to_string()
                },
                &variables
            ),
            PackageState::Present
        );
        assert_eq!(
            evaluate_condition(
                &DetectCondition::PathExists {
                    path: "[Root]/missing".to_string()
                },
                &variables
            ),
            PackageState::Absent
        );
        assert_eq!(
            evaluate_condition(
                &DetectCondition::Variable {
                    name: "Installed".to_string()
                },
                &variables
            ),
            PackageState::Present
        );
    }

    #[test]
    fn test_msi_has_no_engine() {
        let engines = PackageEngines::default();
        assert!(engines.supports(PackageKind::Exe));
        assert!(!engines.supports(PackageKind::Msi));

        let package: Package = serde_yaml::from_str(
            "id: db\nkind: msi\ncache_id: db\npayloads: [db.msi]\n",
        )
        .unwrap();
        assert!(matches!(
            engines.get(&package),
            Err(BootstrapError::PackageEngineMissing { .. })
        ));
    }
}
