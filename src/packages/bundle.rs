//! Bundle package engine
//!
//! A bundle package is another bootstrapper shipped as a payload. It is run
//! from the cache with `apply --action <action> --quiet`. Related bundles
//! found during Detect are run the same way from their own completed cache
//! directory, with `--relation-type` telling them why.

use std::path::Path;
use std::process::Command;

use tracing::{debug, info};

use super::{PackageContext, PackageEngine, Restart, evaluate_condition, restart_for_exit};
use crate::cache::Cache;
use crate::config::BundleAction;
use crate::domain::{
    ActionState, Package, PackageState, RegistrationRecord, RelationType, RestartExitCodes,
};
use crate::engine::registration::RegistrationStore;
use crate::error::{Result, engine::package_failed};

#[derive(Debug, Default, Clone, Copy)]
pub struct BundleEngine;

/// Bundle-level action that performs a package action
pub fn bundle_action(action: ActionState) -> Option<BundleAction> {
    match action {
        ActionState::None => None,
        ActionState::Install => Some(BundleAction::Install),
        ActionState::Uninstall => Some(BundleAction::Uninstall),
        ActionState::Repair => Some(BundleAction::Repair),
        ActionState::Modify => Some(BundleAction::Modify),
    }
}

/// Command line for a child bootstrapper
pub fn child_arguments(action: BundleAction, relation: RelationType, extra: &[String]) -> Vec<String> {
    let mut args = vec![
        "apply".to_string(),
        "--action".to_string(),
        action.to_string(),
        "--quiet".to_string(),
    ];
    if relation != RelationType::None {
        args.push("--relation-type".to_string());
        args.push(relation.to_string());
    }
    args.extend(extra.iter().cloned());
    args
}

/// Run a bootstrapper executable and map its exit code
pub fn run_bootstrapper(
    id: &str,
    executable: &Path,
    arguments: &[String],
    codes: &RestartExitCodes,
) -> Result<Restart> {
    info!(bundle = id, path = %executable.display(), ?arguments, "running bundle");
    let mut command = Command::new(executable);
    command.args(arguments);
    if let Some(dir) = executable.parent() {
        command.current_dir(dir);
    }

    let status = command
        .status()
        .map_err(|e| package_failed(id, format!("failed to launch {}: {e}", executable.display())))?;
    debug!(bundle = id, ?status, "bundle exited");
    restart_for_exit(id, status.code(), codes)
}

/// Run a related bundle's cached engine
pub fn run_related_bundle(
    cache: &Cache,
    record: &RegistrationRecord,
    action: ActionState,
    relation: RelationType,
) -> Result<Restart> {
    let Some(bundle_action) = bundle_action(action) else {
        return Ok(Restart::None);
    };
    let executable = cache
        .completed_path(record.per_machine, &record.cache_id)
        .path
        .join(&record.executable_name);
    if !executable.is_file() {
        return Err(package_failed(
            &record.id,
            format!("cached engine missing at {}", executable.display()),
        ));
    }

    run_bootstrapper(
        &record.id,
        &executable,
        &child_arguments(bundle_action, relation, &[]),
        &RestartExitCodes::default(),
    )
}

impl PackageEngine for BundleEngine {
    fn detect(&self, package: &Package, context: &PackageContext<'_>) -> Result<PackageState> {
        if let Some(condition) = &package.detect {
            return Ok(evaluate_condition(condition, context.variables));
        }

        let registered = RegistrationStore::for_scope(context.cache.roots(), package.per_machine)
            .read(&package.id)?
            .is_some();
        Ok(if registered {
            PackageState::Present
        } else {
            PackageState::Absent
        })
    }

    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        context: &PackageContext<'_>,
        progress: &mut dyn FnMut(u8) -> Result<()>,
    ) -> Result<Restart> {
        let Some(bundle_action) = bundle_action(action) else {
            return Ok(Restart::None);
        };

        let executable = context.executable_path(package)?;
        let extra: Vec<String> = package
            .install_arguments
            .iter()
            .map(|a| context.variables.expand(a))
            .collect();
        progress(0)?;

        let restart = run_bootstrapper(
            &package.id,
            &executable,
            &child_arguments(bundle_action, RelationType::None, &extra),
            &package.restart_exit_codes,
        )?;
        if let Err(e) = progress(100) {
            debug!(package = %package.id, error = %e, "cancel after completion");
        }
        Ok(restart)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_arguments() {
        assert_eq!(
            child_arguments(BundleAction::Uninstall, RelationType::Upgrade, &[]),
            vec!["apply", "--action", "uninstall", "--quiet", "--relation-type", "upgrade"]
        );
        assert_eq!(
            child_arguments(BundleAction::Install, RelationType::None, &["--x".to_string()]),
            vec!["apply", "--action", "install", "--quiet", "--x"]
        );
    }

    #[test]
    fn test_bundle_action_mapping() {
        assert_eq!(bundle_action(ActionState::None), None);
        assert_eq!(bundle_action(ActionState::Repair), Some(BundleAction::Repair));
    }

    #[test]
    fn test_missing_related_engine_fails() {
        let temp = tempfile::TempDir::new().unwrap();
        let cache = Cache::with_folders(
            &crate::cache::KnownFolders {
                per_machine_data: temp.path().join("m"),
                per_user_data: temp.path().join("u"),
            },
            &crate::config::EngineCommand::default(),
            &crate::config::MachinePolicy::default(),
        );
        let record = RegistrationRecord {
            id: "old".to_string(),
            name: "Old".to_string(),
            version: "0.9.0".to_string(),
            upgrade_code: Some("acme".to_string()),
            per_machine: false,
            cache_id: "old-1".to_string(),
            executable_name: "setup".to_string(),
            addon_for: vec![],
            patch_for: vec![],
        };

        let err = run_related_bundle(&cache, &record, ActionState::Uninstall, RelationType::Upgrade).unwrap_err();
        assert!(err.to_string().contains("cached engine missing"));
        assert_eq!(
            run_related_bundle(&cache, &record, ActionState::None, RelationType::Upgrade).unwrap(),
            Restart::None
        );
    }
}
