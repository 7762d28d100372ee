//! Machine policy (`policy.yaml`)
//!
//! Administrators can redirect the per-machine package cache, choose the base
//! directory for elevated working folders and configure how elevation is
//! obtained. A missing policy file means "no policy".

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{
    Result,
    config::{parse_failed, read_failed},
};

/// Environment variable overriding the policy file location
pub const POLICY_ENV: &str = "BOOTSTRAPPER_POLICY";

const POLICY_FILE: &str = "policy.yaml";

/// Retry tuning for file operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Machine-wide policy values
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachinePolicy {
    /// Redirected per-machine package cache root
    #[serde(default)]
    pub package_cache_folder: Option<PathBuf>,

    /// Base directory for elevated working folders
    #[serde(default)]
    pub engine_working_directory: Option<PathBuf>,

    /// Command prefix used to launch the elevated companion (e.g. `["sudo", "-n"]`)
    #[serde(default)]
    pub elevation_launcher: Option<Vec<String>>,

    #[serde(default)]
    pub retry: Option<RetrySettings>,
}

impl MachinePolicy {
    /// Load policy from `BOOTSTRAPPER_POLICY` or the machine configuration directory
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(POLICY_ENV) {
            Some(path) => PathBuf::from(path),
            None => default_policy_path(),
        };
        Self::load_from(&path)
    }

    /// Load policy from a specific file; a missing file yields the empty policy
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.is_file() {
            debug!(path = %path.display(), "no machine policy");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| read_failed(path.display().to_string(), e.to_string()))?;
        let policy: Self = serde_yaml::from_str(&content)
            .map_err(|e| parse_failed(path.display().to_string(), e.to_string()))?;

        debug!(path = %path.display(), ?policy, "loaded machine policy");
        Ok(policy)
    }
}

/// Machine-wide configuration directory for the bootstrapper
pub fn machine_config_dir() -> PathBuf {
    #[cfg(windows)]
    {
        std::env::var_os("PROGRAMDATA")
            .map_or_else(|| PathBuf::from("C:\\ProgramData"), PathBuf::from)
            .join("Bootstrapper")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/bootstrapper")
    }
}

fn default_policy_path() -> PathBuf {
    machine_config_dir().join(POLICY_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_missing_policy_is_empty() {
        let temp = TempDir::new().unwrap();
        let policy = MachinePolicy::load_from(&temp.path().join("none.yaml")).unwrap();
        assert_eq!(policy, MachinePolicy::default());
    }

    #[test]
    fn test_parse_policy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policy.yaml");
        std::fs::write(
            &path,
            "package_cache_folder: /srv/cache\nelevation_launcher: [sudo, -n]\nretry:\n  attempts: 5\n  delay_ms: 10\n",
        )
        .unwrap();

        let policy = MachinePolicy::load_from(&path).unwrap();
        assert_eq!(policy.package_cache_folder, Some(PathBuf::from("/srv/cache")));
        assert_eq!(
            policy.elevation_launcher,
            Some(vec!["sudo".to_string(), "-n".to_string()])
        );
        assert_eq!(policy.retry.unwrap().delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_policy_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policy.yaml");
        std::fs::write(&path, "retry: [unclosed").unwrap();
        assert!(MachinePolicy::load_from(&path).is_err());
    }

    #[test]
    #[serial]
    fn test_policy_env_override() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("policy.yaml");
        std::fs::write(&path, "engine_working_directory: /srv/work\n").unwrap();

        unsafe {
            std::env::set_var(POLICY_ENV, &path);
        }
        let policy = MachinePolicy::load();
        unsafe {
            std::env::remove_var(POLICY_ENV);
        }

        assert_eq!(
            policy.unwrap().engine_working_directory,
            Some(PathBuf::from("/srv/work"))
        );
    }
}
