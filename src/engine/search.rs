//! Authored searches
//!
//! Searches run at the start of Detect and set variables that detect
//! conditions and package arguments can reference.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::variables::Variables;

/// Something that sets variables from the state of the machine
pub trait Search {
    fn run(&self, variables: &mut Variables) -> Result<()>;
}

/// A search declared in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchSpec {
    /// Sets `variable` to `1` when the file exists, else `0`
    FileExists { variable: String, path: String },
    /// Sets `variable` to `1` when the directory exists, else `0`
    DirectoryExists { variable: String, path: String },
    /// Copies an environment variable; unset leaves `variable` untouched
    Environment { variable: String, name: String },
}

impl Search for SearchSpec {
    fn run(&self, variables: &mut Variables) -> Result<()> {
        match self {
            SearchSpec::FileExists { variable, path } => {
                let found = Path::new(&variables.expand(path)).is_file();
                debug!(variable, found, "file search");
                variables.set_bool(variable.as_str(), found);
            }
            SearchSpec::DirectoryExists { variable, path } => {
                let found = Path::new(&variables.expand(path)).is_dir();
                debug!(variable, found, "directory search");
                variables.set_bool(variable.as_str(), found);
            }
            SearchSpec::Environment { variable, name } => {
                if let Some(value) = std::env::var_os(name) {
                    variables.set(variable.as_str(), value.to_string_lossy());
                }
            }
        }
        Ok(())
    }
}

/// Run searches in authored order
pub fn run_searches(searches: &[SearchSpec], variables: &mut Variables) -> Result<()> {
    for search in searches {
        search.run(variables)?;
    }
    Ok(())
}
