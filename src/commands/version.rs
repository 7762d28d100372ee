//! Version command implementation

use crate::config::manifest::MANIFEST_FILE;
use crate::config::policy::{POLICY_ENV, machine_config_dir};
use crate::error::Result;

/// Run version command
pub fn run() -> Result<()> {
    println!("bootstrapper {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Build info:");
    println!("  Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    println!("  Profile: {}", build_profile());
    println!();
    println!("Defaults:");
    println!("  Manifest: {MANIFEST_FILE} next to the executable");
    println!(
        "  Machine policy: {} (override with {POLICY_ENV})",
        machine_config_dir().display()
    );

    Ok(())
}

fn build_profile() -> &'static str {
    if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    }
}
