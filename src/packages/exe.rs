//! Exe package engine
//!
//! Runs the package's cached executable with the arguments authored for the
//! action. Detection uses the package's detect condition.

use std::process::Command;

use tracing::{debug, info};

use super::{PackageContext, PackageEngine, Restart, evaluate_condition, restart_for_exit};
use crate::domain::{ActionState, Package, PackageState};
use crate::error::{Result, engine::package_failed};

#[derive(Debug, Default, Clone, Copy)]
pub struct ExeEngine;

impl ExeEngine {
    /// Authored arguments for `action`, with variables expanded
    fn arguments(package: &Package, action: ActionState, context: &PackageContext<'_>) -> Result<Vec<String>> {
        let authored = match action {
            ActionState::Install | ActionState::Modify => Some(&package.install_arguments),
            ActionState::Repair => package.repair_arguments.as_ref(),
            ActionState::Uninstall => package.uninstall_arguments.as_ref(),
            ActionState::None => return Ok(Vec::new()),
        };
        let authored = authored
            .ok_or_else(|| package_failed(&package.id, format!("package does not support {action}")))?;

        Ok(authored.iter().map(|a| context.variables.expand(a)).collect())
    }
}

impl PackageEngine for ExeEngine {
    fn detect(&self, package: &Package, context: &PackageContext<'_>) -> Result<PackageState> {
        Ok(package
            .detect
            .as_ref()
            .map_or(PackageState::Absent, |c| evaluate_condition(c, context.variables)))
    }

    fn execute(
        &self,
        package: &Package,
        action: ActionState,
        context: &PackageContext<'_>,
        progress: &mut dyn FnMut(u8) -> Result<()>,
    ) -> Result<Restart> {
        if action == ActionState::None {
            return Ok(Restart::None);
        }

        let executable = context.executable_path(package)?;
        let arguments = Self::arguments(package, action, context)?;
        progress(0)?;

        info!(package = %package.id, %action, path = %executable.display(), "running exe package");
        let mut command = Command::new(&executable);
        command.args(&arguments);
        if let Some(dir) = executable.parent() {
            command.current_dir(dir);
        }

        let status = command.status().map_err(|e| {
            package_failed(
                &package.id,
                format!("failed to launch {}: {e}", executable.display()),
            )
        })?;
        debug!(package = %package.id, ?status, "exe package exited");

        let restart = restart_for_exit(&package.id, status.code(), &package.restart_exit_codes)?;
        // The package already ran; a late cancel only affects what runs next.
        if let Err(e) = progress(100) {
            debug!(package = %package.id, error = %e, "cancel after completion");
        }
        Ok(restart)
    }
}
