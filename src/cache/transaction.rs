//! Cache transaction for apply
//!
//! Tracks cache directories created during one apply so a failed apply can
//! evict whatever it cached but no longer needs.
//!
//! ## Usage
//!
//! ```ignore
//! let mut transaction = CacheTransaction::new(&cache);
//!
//! // Cache thread reports what it created...
//! transaction.track_created(package.per_machine, &package.cache_id);
//!
//! // A package that ended up installed keeps its cache:
//! transaction.keep(&package.cache_id);
//!
//! // On success:
//! transaction.commit();
//!
//! // On failure (automatic via Drop if not committed):
//! // tracked directories are removed
//! ```

use tracing::{debug, warn};

use super::Cache;
use crate::error::Result;

/// Removes a package's completed cache directory
pub trait CacheRemover {
    fn remove_package(&self, per_machine: bool, cache_id: &str) -> Result<()>;
}

impl CacheRemover for Cache {
    fn remove_package(&self, per_machine: bool, cache_id: &str) -> Result<()> {
        Cache::remove_package(self, per_machine, cache_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CreatedEntry {
    per_machine: bool,
    cache_id: String,
}

/// Cache directories created by one apply
pub struct CacheTransaction<'a> {
    remover: &'a dyn CacheRemover,

    /// Directories created during this transaction, in creation order
    created: Vec<CreatedEntry>,

    /// Whether the transaction has been committed
    committed: bool,

    /// Whether rollback is enabled (disabled by `--disable-rollback`)
    rollback_enabled: bool,
}

impl<'a> CacheTransaction<'a> {
    pub fn new(remover: &'a dyn CacheRemover) -> Self {
        Self {
            remover,
            created: Vec::new(),
            committed: false,
            rollback_enabled: true,
        }
    }

    pub fn disable_rollback(&mut self) {
        self.rollback_enabled = false;
    }

    /// Track a cache directory that did not exist before this apply
    pub fn track_created(&mut self, per_machine: bool, cache_id: impl Into<String>) {
        let entry = CreatedEntry {
            per_machine,
            cache_id: cache_id.into(),
        };
        if !self.created.contains(&entry) {
            self.created.push(entry);
        }
    }

    /// Stop tracking a directory that must survive rollback
    pub fn keep(&mut self, cache_id: &str) {
        self.created.retain(|e| e.cache_id != cache_id);
    }

    pub fn tracked(&self) -> impl Iterator<Item = &str> {
        self.created.iter().map(|e| e.cache_id.as_str())
    }

    /// Commit the transaction (prevent rollback)
    pub fn commit(mut self) {
        self.committed = true;
    }

    /// Remove every tracked directory, newest first.
    ///
    /// Every directory is attempted; the first failure is returned.
    pub fn rollback(&mut self) -> Result<()> {
        if self.committed || !self.rollback_enabled {
            return Ok(());
        }

        let mut first_error = None;
        while let Some(entry) = self.created.pop() {
            debug!(cache_id = %entry.cache_id, "rolling back cached package");
            if let Err(e) = self.remover.remove_package(entry.per_machine, &entry.cache_id) {
                warn!(cache_id = %entry.cache_id, error = %e, "failed to roll back cached package");
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for CacheTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed && self.rollback_enabled {
            // Automatic rollback on drop if not committed
            if let Err(e) = self.rollback() {
                warn!(error = %e, "cache rollback failed");
            }
        }
    }
}
