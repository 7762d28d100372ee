//! Bundle manifest (`bundle.yaml`)
//!
//! The manifest is the authoritative static description of a bundle. It is
//! parsed and structurally validated here; nothing else in the engine checks it
//! again.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{Container, Package, Payload, RegistrationInfo, RollbackBoundary};
use crate::engine::search::SearchSpec;
use crate::error::{
    Result,
    config::{invalid, not_found, parse_failed, read_failed},
};

/// Default manifest file name next to the bootstrapper
pub const MANIFEST_FILE: &str = "bundle.yaml";

/// Location of a newer bundle that can replace this one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSource {
    pub location: String,
    pub version: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub hash: Option<String>,
}

/// An executable the elevated companion may launch on request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedExe {
    pub id: String,
    /// Absolute path; `[Variable]` references are expanded
    pub path: String,
    #[serde(default)]
    pub arguments: Vec<String>,
}

/// Parsed bundle manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub bundle: RegistrationInfo,

    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    #[serde(default)]
    pub searches: Vec<SearchSpec>,

    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub payloads: Vec<Payload>,

    #[serde(default)]
    pub packages: Vec<Package>,

    #[serde(default)]
    pub rollback_boundaries: Vec<RollbackBoundary>,

    #[serde(default)]
    pub update: Option<UpdateSource>,

    #[serde(default)]
    pub approved_exes: Vec<ApprovedExe>,
}

impl Manifest {
    /// Load and validate a manifest file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(not_found(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| read_failed(path.display().to_string(), e.to_string()))?;

        let manifest: Self = serde_yaml::from_str(&content)
            .map_err(|e| parse_failed(path.display().to_string(), e.to_string()))?;
        manifest.validate()?;

        debug!(
            path = %path.display(),
            packages = manifest.packages.len(),
            payloads = manifest.payloads.len(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Parse and validate a manifest from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let manifest: Self = serde_yaml::from_str(yaml)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject dangling references, duplicates and unsafe relative paths
    pub fn validate(&self) -> Result<()> {
        self.bundle.parsed_version()?;
        check_relative("bundle cache id", &self.bundle.cache_id)?;

        let mut container_ids = HashSet::new();
        for container in &self.containers {
            if !container_ids.insert(container.id.as_str()) {
                return Err(invalid(format!("duplicate container '{}'", container.id)));
            }
            check_relative("container path", &container.file_path)?;
        }

        let mut payload_keys = HashSet::new();
        for payload in &self.payloads {
            if !payload_keys.insert(payload.key.as_str()) {
                return Err(invalid(format!("duplicate payload '{}'", payload.key)));
            }
            check_relative("payload path", &payload.file_path)?;
            check_relative("payload source path", payload.source_relative_path())?;
            if let Some(container) = &payload.container {
                if !container_ids.contains(container.as_str()) {
                    return Err(invalid(format!(
                        "payload '{}' references unknown container '{container}'",
                        payload.key
                    )));
                }
            }
        }

        let boundary_ids: HashSet<&str> = self
            .rollback_boundaries
            .iter()
            .map(|b| b.id.as_str())
            .collect();

        let mut package_ids = HashSet::new();
        for package in &self.packages {
            if !package_ids.insert(package.id.as_str()) {
                return Err(invalid(format!("duplicate package '{}'", package.id)));
            }
            check_relative("package cache id", &package.cache_id)?;
            if package.payloads.is_empty() {
                return Err(invalid(format!("package '{}' has no payloads", package.id)));
            }
            for key in &package.payloads {
                if !payload_keys.contains(key.as_str()) {
                    return Err(invalid(format!(
                        "package '{}' references unknown payload '{key}'",
                        package.id
                    )));
                }
            }
            if let Some(exe) = &package.executable {
                if !package.payloads.contains(exe) {
                    return Err(invalid(format!(
                        "package '{}' executable '{exe}' is not one of its payloads",
                        package.id
                    )));
                }
            }
            if let Some(boundary) = &package.rollback_boundary {
                if !boundary_ids.contains(boundary.as_str()) {
                    return Err(invalid(format!(
                        "package '{}' references unknown rollback boundary '{boundary}'",
                        package.id
                    )));
                }
            }
        }

        let mut approved_ids = HashSet::new();
        for exe in &self.approved_exes {
            if !approved_ids.insert(exe.id.as_str()) {
                return Err(invalid(format!("duplicate approved exe '{}'", exe.id)));
            }
        }

        if let Some(update) = &self.update {
            semver::Version::parse(&update.version)
                .map_err(|e| invalid(format!("update version '{}': {e}", update.version)))?;
        }

        Ok(())
    }

    pub fn payload(&self, key: &str) -> Option<&Payload> {
        self.payloads.iter().find(|p| p.key == key)
    }

    pub fn container(&self, id: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn package(&self, id: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.id == id)
    }

    pub fn package_mut(&mut self, id: &str) -> Option<&mut Package> {
        self.packages.iter_mut().find(|p| p.id == id)
    }

    pub fn approved_exe(&self, id: &str) -> Option<&ApprovedExe> {
        self.approved_exes.iter().find(|e| e.id == id)
    }

    pub fn boundary(&self, id: &str) -> Option<&RollbackBoundary> {
        self.rollback_boundaries.iter().find(|b| b.id == id)
    }

    /// Payloads of a package, in authored order
    pub fn package_payloads<'a>(&'a self, package: &'a Package) -> impl Iterator<Item = &'a Payload> {
        package.payloads.iter().filter_map(|key| self.payload(key))
    }

    /// Whether any package is installed per machine
    pub fn has_per_machine_packages(&self) -> bool {
        self.bundle.per_machine || self.packages.iter().any(|p| p.per_machine)
    }
}

/// Locate the manifest next to an executable or inside a directory
pub fn manifest_path_for(location: &Path) -> PathBuf {
    if location.is_dir() {
        location.join(MANIFEST_FILE)
    } else {
        location
            .parent()
            .map_or_else(|| PathBuf::from(MANIFEST_FILE), |p| p.join(MANIFEST_FILE))
    }
}

fn check_relative(what: &str, value: &str) -> Result<()> {
    let path = Path::new(value);
    let escapes = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if value.is_empty() || escapes {
        return Err(invalid(format!("{what} '{value}' must be a relative path inside the bundle")));
    }
    Ok(())
}
