//! Cache statistics and listing
//!
//! This module provides functions for listing cache entries and getting
//! statistics about a cache root.

use std::fs;
use std::path::Path;

use walkdir::WalkDir;

use super::paths::UNVERIFIED_FOLDER;
use crate::error::{Result, cache::operation_failed};

/// One completed cache directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub cache_id: String,
    /// Total size in bytes
    pub size: u64,
}

impl CachedEntry {
    /// Format size as human-readable string
    pub fn formatted_size(&self) -> String {
        format_size(self.size)
    }
}

/// Cache statistics for one root
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of completed cache directories
    pub entries: usize,
    /// Total size of completed entries in bytes
    pub total_size: u64,
    /// Bytes left in the unverified staging area
    pub unverified_size: u64,
}

impl CacheStats {
    /// Format total size as human-readable string
    pub fn formatted_size(&self) -> String {
        format_size(self.total_size)
    }
}

pub fn format_size(bytes: u64) -> String {
    let size = bytes as f64;
    if size < 1024.0 {
        format!("{bytes} B")
    } else if size < 1024.0 * 1024.0 {
        format!("{:.1} KB", size / 1024.0)
    } else if size < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB", size / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", size / (1024.0 * 1024.0 * 1024.0))
    }
}

/// List completed cache directories under a root; dot-folders are internal
pub fn list_entries(root: &Path) -> Result<Vec<CachedEntry>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(root)
        .map_err(|e| operation_failed(format!("Failed to read cache directory: {e}")))?
    {
        let entry = entry.map_err(|e| operation_failed(format!("Failed to read entry: {e}")))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();

        if !path.is_dir() || name.starts_with('.') {
            continue;
        }

        entries.push(CachedEntry {
            cache_id: name,
            size: dir_size(&path)?,
        });
    }

    entries.sort_by(|a, b| a.cache_id.cmp(&b.cache_id));
    Ok(entries)
}

/// Get statistics for a cache root
pub fn cache_stats(root: &Path) -> Result<CacheStats> {
    let entries = list_entries(root)?;
    let unverified = root.join(UNVERIFIED_FOLDER);

    Ok(CacheStats {
        entries: entries.len(),
        total_size: entries.iter().map(|e| e.size).sum(),
        unverified_size: if unverified.exists() {
            dir_size(&unverified)?
        } else {
            0
        },
    })
}

/// Calculate directory size recursively
fn dir_size(path: &Path) -> Result<u64> {
    let mut size = 0u64;
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(std::result::Result::ok)
    {
        if entry.file_type().is_file() {
            size += entry
                .metadata()
                .map_err(|e| operation_failed(format!("Failed to get metadata: {e}")))?
                .len();
        }
    }
    Ok(size)
}
