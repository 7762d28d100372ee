use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Arguments the primary passes to an elevated companion
#[derive(Parser, Debug)]
pub struct CompanionArgs {
    /// Loopback address the primary listens on
    #[arg(long)]
    pub address: SocketAddr,

    #[arg(long)]
    pub parent_pid: u32,

    #[arg(long)]
    pub manifest: PathBuf,

    /// Run id shared with the primary
    #[arg(long)]
    pub run_id: String,

    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    /// Machine policy file, forwarded because launchers reset the environment
    #[arg(long)]
    pub policy: Option<PathBuf>,
}
