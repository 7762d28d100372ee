//! Bootstrapper command line entry point

use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use bootstrapper::cli::{Cli, Commands};
use bootstrapper::commands;

/// Environment variable overriding the `-v` log filter
const LOG_ENV: &str = "BOOTSTRAPPER_LOG";

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose > 1)
        .try_init();
}

fn main() {
    let cli = Cli::parse();

    // The companion logs to its primary instead of stderr.
    if !matches!(cli.command, Commands::Companion(_)) {
        init_logging(cli.verbose);
    }

    let result = match cli.command {
        Commands::Apply(args) => {
            let result = commands::apply::run(args);
            let code = commands::apply::exit_code(&result);
            match result {
                Err(e) if !e.is_user_exit() => report(e),
                Err(_) => eprintln!("{}", style("Canceled.").yellow()),
                Ok(_) => {}
            }
            std::process::exit(code);
        }
        Commands::Cache(args) => commands::cache::run(args),
        Commands::Companion(args) => commands::companion::run(args),
        Commands::Version => commands::version::run(),
        Commands::Completions(args) => commands::completions::run(args),
    };

    if let Err(e) = result {
        report(e);
        std::process::exit(1);
    }
}

fn report(error: bootstrapper::BootstrapError) {
    eprintln!("{} {error}", style("Error:").red().bold());
    if let Some(help) = miette::Diagnostic::help(&error) {
        eprintln!("  {} {help}", style("help:").cyan());
    }
}
