//! Engine variables
//!
//! A string key/value set holding authored variables, search results and the
//! built-in `Bundle*` values the engine maintains. The set is persisted as
//! JSON so Detect can restore prior values across resumes and elevation.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, fs::write_failed};

/// Full path of the bundle executable that was originally launched
pub const BUNDLE_ORIGINAL_SOURCE: &str = "BundleOriginalSource";
/// Folder of [`BUNDLE_ORIGINAL_SOURCE`]
pub const BUNDLE_ORIGINAL_SOURCE_FOLDER: &str = "BundleOriginalSourceFolder";
/// Folder a source was last successfully resolved from
pub const BUNDLE_LAST_USED_SOURCE: &str = "BundleLastUsedSource";
/// Set to `1` once an elevated companion is attached
pub const BUNDLE_ELEVATED: &str = "BundleElevated";
pub const BUNDLE_ACTION: &str = "BundleAction";
pub const BUNDLE_VERSION: &str = "BundleVersion";
/// Set to `1` when the bundle is registered on the machine
pub const BUNDLE_INSTALLED: &str = "BundleInstalled";
/// Set to `1` when a package reported that a restart is required
pub const REBOOT_PENDING: &str = "RebootPending";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Truthy unless unset, empty, `0` or `false`
    pub fn get_bool(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|v| !(v.is_empty() || v == "0" || v.eq_ignore_ascii_case("false")))
    }

    pub fn set_bool(&mut self, name: impl Into<String>, value: bool) {
        self.set(name, if value { "1" } else { "0" });
    }

    /// Copy values from `other` that are not set here
    pub fn fill_from(&mut self, other: &BTreeMap<String, String>) {
        for (name, value) in other {
            self.values
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// Overwrite with every value in `other`
    pub fn merge(&mut self, other: &Variables) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replace `[Name]` references with variable values; unknown names expand to
    /// the empty string and brackets around anything that is not a name are kept.
    pub fn expand(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find('[') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];

            match after.find(']') {
                Some(end) if is_variable_name(&after[..end]) => {
                    out.push_str(self.get(&after[..end]).unwrap_or_default());
                    rest = &after[end + 1..];
                }
                _ => {
                    out.push('[');
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        out
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Persist to a state file, creating its directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_failed(parent, &e))?;
        }
        std::fs::write(path, self.to_json()?).map_err(|e| write_failed(path, &e))
    }

    /// Load a state file; a missing file yields `None`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(Self::from_json(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(crate::error::fs::read_failed(path, &e)),
        }
    }
}

fn is_variable_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
