use clap::{Parser, Subcommand};

/// Arguments for cache command
#[derive(Parser, Debug)]
#[command(after_help = "EXAMPLES:\n  \
                  Show cache statistics:\n    bootstrapper cache\n\n\
                  Show the resolved cache roots:\n    bootstrapper cache paths\n\n\
                  Remove one cached package:\n    bootstrapper cache remove app-1.0\n\n\
                  Remove leftover staging files:\n    bootstrapper cache clean")]
pub struct CacheArgs {
    #[command(subcommand)]
    pub command: Option<CacheSubcommand>,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheSubcommand {
    /// Show the per-machine and per-user cache roots
    Paths,

    /// List cached entries with their sizes
    Stats,

    /// Remove a cached package or bundle by cache id
    Remove(RemoveArgs),

    /// Remove unverified staging files from the cache
    Clean(CleanArgs),
}

/// Arguments for cache remove command
#[derive(Parser, Debug)]
pub struct RemoveArgs {
    /// Cache id (directory name under the cache root)
    pub cache_id: String,

    /// Remove from the per-machine cache instead of the per-user cache
    #[arg(long)]
    pub per_machine: bool,
}

/// Arguments for cache clean command
#[derive(Parser, Debug)]
pub struct CleanArgs {
    /// Clean the per-machine cache instead of the per-user cache
    #[arg(long)]
    pub per_machine: bool,
}
