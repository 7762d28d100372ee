use std::path::PathBuf;

use clap::Parser;

use crate::config::{BundleAction, EngineCommand};
use crate::domain::RelationType;

/// Arguments for the apply command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Install the bundle next to the executable:\n    bootstrapper apply\n\n\
                  Install from a specific manifest:\n    bootstrapper apply --manifest ./dist/bundle.yaml\n\n\
                  Uninstall:\n    bootstrapper apply --action uninstall\n\n\
                  Copy the bundle and its payloads for offline use:\n    bootstrapper apply --action layout --layout /mnt/share/suite\n\n\
                  Cache while executing:\n    bootstrapper apply --parallel-cache")]
pub struct ApplyArgs {
    /// Bundle manifest (defaults to bundle.yaml next to the executable)
    #[arg(long, short = 'm', env = "BOOTSTRAPPER_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Action to perform
    #[arg(long, short = 'a', value_enum, default_value_t = BundleAction::Install)]
    pub action: BundleAction,

    /// Destination directory for --action layout
    #[arg(long, value_name = "DIR")]
    pub layout: Option<PathBuf>,

    /// Base directory for the working folder
    #[arg(long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Cache and execute at the same time
    #[arg(long)]
    pub parallel_cache: bool,

    /// Leave executed packages in place when the apply fails
    #[arg(long)]
    pub disable_rollback: bool,

    /// Relation this bundle has to the bundle that launched it
    #[arg(long, value_enum, default_value_t = RelationType::None, hide = true)]
    pub relation_type: RelationType,

    /// Do not draw progress
    #[arg(long, short = 'q')]
    pub quiet: bool,

    /// Detect and plan, then print the plan without applying it
    #[arg(long)]
    pub dry_run: bool,
}

impl ApplyArgs {
    pub fn engine_command(&self) -> EngineCommand {
        EngineCommand {
            action: self.action,
            layout_directory: self.layout.clone(),
            working_directory: self.working_dir.clone(),
            parallel_cache: self.parallel_cache,
            disable_rollback: self.disable_rollback,
            relation_type: self.relation_type,
            ..EngineCommand::default()
        }
    }
}
