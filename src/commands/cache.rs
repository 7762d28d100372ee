//! Cache command: inspect and maintain the package cache

use console::style;

use crate::cache::{Cache, stats};
use crate::cli::{CacheArgs, CacheSubcommand};
use crate::config::{EngineCommand, MachinePolicy};
use crate::error::Result;

pub fn run(args: CacheArgs) -> Result<()> {
    let policy = MachinePolicy::load()?;
    let cache = Cache::initialize(&EngineCommand::default(), &policy)?;

    match args.command {
        None => show_cache_stats(&cache),
        Some(CacheSubcommand::Paths) => {
            show_paths(&cache);
            Ok(())
        }
        Some(CacheSubcommand::Stats) => list_entries(&cache),
        Some(CacheSubcommand::Remove(remove)) => {
            let completed = cache.completed_path(remove.per_machine, &remove.cache_id);
            if !completed.path.exists() {
                println!("{} is not cached.", remove.cache_id);
                return Ok(());
            }
            cache.remove_package(remove.per_machine, &remove.cache_id)?;
            println!("Removed {} from {}", style(&remove.cache_id).cyan(), completed.path.display());
            Ok(())
        }
        Some(CacheSubcommand::Clean(clean)) => {
            cache.cleanup(clean.per_machine)?;
            println!("Removed unverified files from {}", cache.roots().root(clean.per_machine).display());
            Ok(())
        }
    }
}

fn scope_name(per_machine: bool) -> &'static str {
    if per_machine { "per-machine" } else { "per-user" }
}

fn show_paths(cache: &Cache) {
    let roots = cache.roots();
    for per_machine in [true, false] {
        println!("{}: {}", scope_name(per_machine), roots.root(per_machine).display());
    }
    if roots.is_redirected() {
        println!("  (redirected from {})", roots.default_per_machine_root().display());
    }
}

fn show_cache_stats(cache: &Cache) -> Result<()> {
    println!("Cache Statistics:");
    let mut total = 0;
    for per_machine in [true, false] {
        let root = cache.roots().root(per_machine);
        let stats = stats::cache_stats(root)?;
        total += stats.entries;
        println!("  {} ({}):", scope_name(per_machine), root.display());
        println!("    Entries: {}", stats.entries);
        println!("    Size: {}", stats.formatted_size());
        if stats.unverified_size > 0 {
            println!("    Unverified: {}", stats::format_size(stats.unverified_size));
        }
    }

    if total == 0 {
        println!("\nCache is empty.");
    } else {
        println!("\nRun 'bootstrapper cache stats' to list cached entries.");
        println!("Run 'bootstrapper cache remove <cache-id>' to remove one entry.");
    }
    Ok(())
}

fn list_entries(cache: &Cache) -> Result<()> {
    for per_machine in [true, false] {
        let root = cache.roots().root(per_machine);
        let entries = stats::list_entries(root)?;
        println!("{} ({}):", scope_name(per_machine), root.display());
        if entries.is_empty() {
            println!("  No cached entries.");
            continue;
        }
        for entry in &entries {
            println!("  {} ({})", entry.cache_id, entry.formatted_size());
        }
    }
    Ok(())
}
