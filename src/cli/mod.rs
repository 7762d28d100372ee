//! CLI definitions using clap derive API
//!
//! Argument types live in one submodule per command:
//! - apply: Apply command arguments
//! - cache: Cache command arguments
//! - companion: Arguments of the hidden elevated companion
//! - completions: Completions command arguments

use clap::builder::{Styles, styling::AnsiColor};
use clap::{ArgAction, Parser, Subcommand};

pub mod apply;
pub mod cache;
pub mod companion;
pub mod completions;

pub use apply::ApplyArgs;
pub use cache::{CacheArgs, CacheSubcommand, CleanArgs, RemoveArgs};
pub use companion::CompanionArgs;
pub use completions::CompletionsArgs;

/// Bootstrapper - installation bundle engine
///
/// Detects, plans, caches and applies the packages of a bundle with rollback.
#[derive(Parser, Debug)]
#[command(
    name = "bootstrapper",
    author,
    version,
    color = clap::ColorChoice::Always,
    styles = Styles::styled()
        .header(AnsiColor::Green.on_default().bold())
        .usage(AnsiColor::Green.on_default().bold())
        .literal(AnsiColor::Cyan.on_default().bold())
        .placeholder(AnsiColor::Cyan.on_default()),
    about = "Installation bootstrapper: detect, plan, cache and apply package bundles",
    long_about = "Bootstrapper installs a bundle of packages described by a manifest. It detects \
                  what is already on the machine, plans the actions for the requested operation, \
                  caches and verifies every payload and executes the packages with rollback on failure.",
    after_help = "\x1b[1m\x1b[32mExamples:\x1b[0m\n   \
                  bootstrapper apply                          \x1b[90m# Install the bundle next to the executable\x1b[0m\n   \
                  bootstrapper apply --action uninstall       \x1b[90m# Uninstall the bundle\x1b[0m\n   \
                  bootstrapper apply --action repair -v       \x1b[90m# Repair with info logging\x1b[0m\n   \
                  bootstrapper apply --dry-run                \x1b[90m# Show the plan only\x1b[0m\n   \
                  bootstrapper cache stats                    \x1b[90m# Show what is cached\x1b[0m\n\n\
                  "
)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(long, short = 'v', global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Detect, plan and apply an action for a bundle
    Apply(ApplyArgs),

    /// Inspect and maintain the package cache
    #[command(name = "cache")]
    Cache(CacheArgs),

    /// Serve per-machine requests for an elevated primary
    #[command(hide = true)]
    Companion(CompanionArgs),

    /// Show version information
    #[command(hide = true)]
    Version,

    /// Generate shell completions
    Completions(CompletionsArgs),
}
