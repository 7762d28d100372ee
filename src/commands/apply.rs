//! Apply command: detect, plan and apply a bundle action

use console::style;

use crate::cli::ApplyArgs;
use crate::config::{BundleAction, MachinePolicy, Manifest, manifest::manifest_path_for};
use crate::engine::{Engine, ExecuteAction, Plan};
use crate::error::{BootstrapError, Result};
use crate::events::ConsoleObserver;
use crate::packages::{EXIT_RESTART_INITIATED, EXIT_RESTART_REQUIRED, Restart, exit_status};

/// Exit code of a canceled run
pub const EXIT_USER_EXIT: i32 = exit_status(1602);

/// Run apply command
pub fn run(args: ApplyArgs) -> Result<Restart> {
    let manifest_path = match &args.manifest {
        Some(path) if path.is_dir() => manifest_path_for(path),
        Some(path) => path.clone(),
        None => manifest_path_for(&std::env::current_exe()?),
    };
    let manifest = Manifest::load(&manifest_path)?;
    let policy = MachinePolicy::load()?;
    let mut engine = Engine::new(manifest, manifest_path, args.engine_command(), policy)?;

    let mut observer = if args.quiet {
        ConsoleObserver::hidden()
    } else {
        ConsoleObserver::new()
    };

    engine.detect(&mut observer)?;
    if args.action == BundleAction::Detect {
        if !args.quiet {
            print_detected(&engine);
        }
        return Ok(Restart::None);
    }

    let plan = engine.plan(&mut observer)?;
    if args.dry_run {
        print_plan(plan);
        return Ok(Restart::None);
    }
    if plan.is_empty() {
        if !args.quiet {
            println!("Nothing to do.");
        }
        return Ok(Restart::None);
    }

    engine.apply(&mut observer)
}

/// Process exit code for the outcome of an apply
pub fn exit_code(result: &Result<Restart>) -> i32 {
    match result {
        Ok(Restart::None) => 0,
        Ok(Restart::Required) => EXIT_RESTART_REQUIRED,
        Ok(Restart::Initiated) => EXIT_RESTART_INITIATED,
        Err(BootstrapError::UserExit) => EXIT_USER_EXIT,
        Err(_) => 1,
    }
}

fn print_detected(engine: &Engine) {
    let bundle = &engine.manifest().bundle;
    let installed = if engine.is_installed() {
        style("installed").green()
    } else {
        style("not installed").yellow()
    };
    println!("{} {} ({installed})", style(&bundle.name).cyan().bold(), bundle.version);
    for package in &engine.manifest().packages {
        println!(
            "  {} {:?}{}",
            package.id,
            package.current_state,
            if package.cached { ", cached" } else { "" }
        );
    }
    for related in engine.related() {
        println!(
            "  related {} {} ({})",
            related.record.id, related.version, related.relation
        );
    }
}

fn print_plan(plan: &Plan) {
    println!("{} {}", style("Plan:").green().bold(), plan.action);
    if plan.downgrade {
        println!("  a newer version is installed; packages are left unchanged");
    }
    for action in &plan.cache_actions {
        println!("  cache   {}", action.key());
    }
    for boundary in &plan.boundaries {
        let name = boundary.id.as_deref().unwrap_or("-");
        let vital = if boundary.vital { "" } else { " (non-vital)" };
        println!("  boundary {name}{vital}");
        for action in &boundary.actions {
            match action {
                ExecuteAction::Package {
                    package_id, action, ..
                } => println!("    {action:<9} {package_id}"),
                ExecuteAction::RelatedBundle {
                    bundle_id, action, ..
                } => println!("    {action:<9} {bundle_id} (related)"),
                ExecuteAction::Update => println!("    update"),
            }
        }
    }
    for clean in &plan.clean_actions {
        println!("  clean   {}", clean.package_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::engine::precondition;

    #[test]
    fn test_exit_codes_are_distinct_statuses() {
        let codes = [
            exit_code(&Ok(Restart::None)),
            exit_code(&Ok(Restart::Required)),
            exit_code(&Ok(Restart::Initiated)),
            exit_code(&Err(BootstrapError::UserExit)),
            exit_code(&Err(precondition("broken"))),
        ];
        assert_eq!(codes[0], 0);
        assert_eq!(codes[4], 1);
        for (i, code) in codes.iter().enumerate() {
            assert!(!codes[i + 1..].contains(code), "duplicate exit code {code}");
            if cfg!(unix) {
                assert!((0..=255).contains(code), "{code} is not a unix exit status");
            }
        }
    }
}
