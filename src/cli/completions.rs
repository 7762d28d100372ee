use clap::Parser;

/// Arguments for completions command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Generate bash completions:\n    bootstrapper completions bash > ~/.bash_completion.d/bootstrapper\n\n\
                  Generate zsh completions:\n    bootstrapper completions zsh > ~/.zfunc/_bootstrapper\n\n\
                  Generate fish completions:\n    bootstrapper completions fish > ~/.config/fish/completions/bootstrapper.fish\n\n\
                  Generate PowerShell completions:\n    bootstrapper completions powershell")]
pub struct CompletionsArgs {
    /// Shell type (bash, elvish, fish, powershell, zsh)
    pub shell: String,
}
