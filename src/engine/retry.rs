//! Per-item retry bookkeeping for one apply

use std::collections::HashMap;

use tracing::debug;

use crate::error::BootstrapError;

/// Attempts allowed per package or container before retry stops being offered
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Clone)]
struct Entry {
    attempts: u32,
    last_error: Option<String>,
}

/// Attempt counts and last errors keyed by package or container id
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_attempts: u32,
    entries: HashMap<String, Entry>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS)
    }
}

impl RetryTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            entries: HashMap::new(),
        }
    }

    /// Record a failed attempt; returns the number of attempts so far
    pub fn record_failure(&mut self, id: &str, error: &BootstrapError) -> u32 {
        let entry = self.entries.entry(id.to_string()).or_default();
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        debug!(id, attempts = entry.attempts, error = %error, "attempt failed");
        entry.attempts
    }

    /// Whether another attempt is allowed
    pub fn can_retry(&self, id: &str) -> bool {
        self.attempts(id) < self.max_attempts
    }

    pub fn attempts(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |e| e.attempts)
    }

    pub fn last_error(&self, id: &str) -> Option<&str> {
        self.entries.get(id).and_then(|e| e.last_error.as_deref())
    }

    pub fn clear(&mut self, id: &str) {
        self.entries.remove(id);
    }
}
