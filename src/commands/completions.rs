//! Shell completions command

use clap::CommandFactory;
use clap_complete::Shell;

use crate::cli::CompletionsArgs;
use crate::error::{Result, config::invalid};

fn parse_shell(name: &str) -> Result<Shell> {
    match name.to_lowercase().as_str() {
        "bash" => Ok(Shell::Bash),
        "elvish" => Ok(Shell::Elvish),
        "fish" => Ok(Shell::Fish),
        "powershell" | "pwsh" => Ok(Shell::PowerShell),
        "zsh" => Ok(Shell::Zsh),
        _ => Err(invalid(format!(
            "unknown shell '{name}'; supported shells: bash, elvish, fish, powershell, zsh"
        ))),
    }
}

/// Write completions for the requested shell to stdout
pub fn run(args: CompletionsArgs) -> Result<()> {
    let shell = parse_shell(&args.shell)?;
    let mut cmd = crate::cli::Cli::command();
    clap_complete::generate(shell, &mut cmd, "bootstrapper", &mut std::io::stdout().lock());
    Ok(())
}
