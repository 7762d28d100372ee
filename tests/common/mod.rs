//! Common test utilities for bootstrapper integration tests

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use bootstrapper::Engine;
use bootstrapper::cache::{Cache, KnownFolders, RetryPolicy};
use bootstrapper::config::{BundleAction, EngineCommand, MachinePolicy, Manifest};
use bootstrapper::elevation::InProcessElevator;
use bootstrapper::events::{Event, Observer, Reply};
use bootstrapper::hash::hash_bytes;
use tempfile::TempDir;

/// One exe package backed by a shell script
#[derive(Debug, Clone)]
pub struct ScriptPackage {
    pub id: String,
    pub exit_code: i32,
    /// Exit code used only for the install action, when set
    pub install_exit_code: Option<i32>,
    pub boundary: Option<String>,
    pub vital: bool,
    pub per_machine: bool,
    /// Authored `restart_exit_codes` yaml
    pub restart_exit_codes: Option<String>,
}

impl ScriptPackage {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            exit_code: 0,
            install_exit_code: None,
            boundary: None,
            vital: true,
            per_machine: false,
            restart_exit_codes: None,
        }
    }

    pub fn failing_install(mut self, code: i32) -> Self {
        self.install_exit_code = Some(code);
        self
    }

    pub fn in_boundary(mut self, boundary: &str) -> Self {
        self.boundary = Some(boundary.to_string());
        self
    }

    pub fn non_vital(mut self) -> Self {
        self.vital = false;
        self
    }

    pub fn restart_exit_codes(mut self, yaml: &str) -> Self {
        self.restart_exit_codes = Some(yaml.to_string());
        self
    }
}

/// A bundle laid out in a temp dir: source folder with engine binary,
/// payload scripts and manifest, plus cache roots and a script log
pub struct TestBundle {
    pub temp: TempDir,
    pub source: PathBuf,
    pub boundaries: Vec<String>,
    packages: Vec<ScriptPackage>,
    extra_yaml: String,
}

impl TestBundle {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp directory");
        let source = temp.path().join("source");
        std::fs::create_dir_all(&source).expect("Failed to create source directory");
        std::fs::write(source.join("setup"), b"engine").expect("Failed to write engine");
        Self {
            temp,
            source,
            boundaries: Vec::new(),
            packages: Vec::new(),
            extra_yaml: String::new(),
        }
    }

    pub fn package(mut self, package: ScriptPackage) -> Self {
        self.packages.push(package);
        self
    }

    /// Authored rollback boundary yaml, e.g. `{ id: optional, vital: false }`
    pub fn boundary(mut self, yaml: &str) -> Self {
        self.boundaries.push(yaml.to_string());
        self
    }

    pub fn extra(mut self, yaml: &str) -> Self {
        self.extra_yaml.push_str(yaml);
        self
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn log_path(&self) -> PathBuf {
        self.path().join("packages.log")
    }

    pub fn marker(&self, id: &str) -> PathBuf {
        self.path().join(format!("{id}.installed"))
    }

    pub fn folders(&self) -> KnownFolders {
        KnownFolders {
            per_machine_data: self.path().join("machine"),
            per_user_data: self.path().join("user"),
        }
    }

    pub fn per_user_root(&self) -> PathBuf {
        self.path().join("user").join("Package Cache")
    }

    /// Lines written by package scripts so far
    pub fn log(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn script(&self, package: &ScriptPackage) -> String {
        let install_exit = package.install_exit_code.unwrap_or(package.exit_code);
        format!(
            "#!/bin/sh\necho \"{id} $1\" >> \"{log}\"\ncase \"$1\" in\n  install) touch \"{marker}\"; exit {install_exit} ;;\n  uninstall) rm -f \"{marker}\" ;;\nesac\nexit {code}\n",
            id = package.id,
            log = self.log_path().display(),
            marker = self.marker(&package.id).display(),
            code = package.exit_code,
        )
    }

    /// Write payload scripts and the manifest; returns the manifest yaml
    pub fn write(&self) -> String {
        let mut payloads = String::new();
        let mut packages = String::new();
        for package in &self.packages {
            let script = self.script(package);
            std::fs::write(self.source.join(format!("{}.sh", package.id)), &script)
                .expect("Failed to write script");
            payloads.push_str(&format!(
                "  - {{ key: {id}, file_path: {id}.sh, verification: {{ kind: hash, hash: {hash} }} }}\n",
                id = package.id,
                hash = hash_bytes(script.as_bytes()),
            ));
            packages.push_str(&format!(
                "  - id: {id}\n    kind: exe\n    cache_id: {id}-1\n    payloads: [{id}]\n    vital: {vital}\n    per_machine: {per_machine}\n    install_arguments: [install]\n    uninstall_arguments: [uninstall]\n    detect: {{ kind: path_exists, path: '{marker}' }}\n",
                id = package.id,
                vital = package.vital,
                per_machine = package.per_machine,
                marker = self.marker(&package.id).display(),
            ));
            if let Some(boundary) = &package.boundary {
                packages.push_str(&format!("    rollback_boundary: {boundary}\n"));
            }
            if let Some(codes) = &package.restart_exit_codes {
                packages.push_str(&format!("    restart_exit_codes: {codes}\n"));
            }
        }

        let mut yaml = format!(
            "bundle: {{ id: suite, name: Suite, version: 1.0.0, upgrade_code: suite, cache_id: suite-1 }}\npayloads:\n{payloads}packages:\n{packages}"
        );
        if !self.boundaries.is_empty() {
            yaml.push_str("rollback_boundaries:\n");
            for boundary in &self.boundaries {
                yaml.push_str(&format!("  - {boundary}\n"));
            }
        }
        yaml.push_str(&self.extra_yaml);
        std::fs::write(self.source.join("bundle.yaml"), &yaml).expect("Failed to write manifest");
        yaml
    }

    /// Overwrite a payload's source so it no longer matches the manifest
    pub fn corrupt(&self, id: &str) {
        std::fs::write(self.source.join(format!("{id}.sh")), "#!/bin/sh\nexit 0\n").expect("Failed to corrupt payload");
    }

    pub fn command(&self, action: BundleAction) -> EngineCommand {
        EngineCommand {
            action,
            working_directory: Some(self.path().join("work")),
            engine_path: Some(self.source.join("setup")),
            ..EngineCommand::default()
        }
    }

    /// Engine over the written manifest with in-process elevation
    pub fn engine(&self, command: EngineCommand) -> Engine {
        let manifest_path = self.source.join("bundle.yaml");
        let manifest = Manifest::load(&manifest_path).expect("Failed to load manifest");
        let policy = MachinePolicy::default();
        let cache = Cache::with_folders(&self.folders(), &command, &policy).with_retry(RetryPolicy::immediate(1));
        Engine::with_cache(manifest, manifest_path, command, policy, cache)
            .expect("Failed to create engine")
            .with_elevator(Box::new(InProcessElevator))
            .with_lock_path(self.path().join("apply.lock"))
    }

    /// Machine policy file that keeps every cache root inside the temp dir
    pub fn policy_file(&self) -> PathBuf {
        let path = self.path().join("policy.yaml");
        std::fs::write(
            &path,
            format!(
                "package_cache_folder: '{}'\nretry: {{ attempts: 1, delay_ms: 0 }}\n",
                self.path().join("machine").join("Package Cache").display()
            ),
        )
        .expect("Failed to write policy");
        path
    }
}

impl Default for TestBundle {
    fn default() -> Self {
        Self::new()
    }
}

type ReplyFn = Box<dyn FnMut(&Event<'_>) -> Reply + Send>;

/// Observer that records event names and answers with a closure
pub struct Recorder {
    pub events: Vec<String>,
    reply: ReplyFn,
}

impl Recorder {
    pub fn new() -> Self {
        Self::replying(|_| Reply::Continue)
    }

    pub fn replying(reply: impl FnMut(&Event<'_>) -> Reply + Send + 'static) -> Self {
        Self {
            events: Vec::new(),
            reply: Box::new(reply),
        }
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.events.iter().any(|e| e.starts_with(prefix))
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for Recorder {
    fn on_event(&mut self, event: &Event<'_>) -> Reply {
        self.events.push(format!("{event:?}"));
        (self.reply)(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_writes_loadable_manifest() {
        let bundle = TestBundle::new()
            .package(ScriptPackage::new("a"))
            .boundary("{ id: optional, vital: false }")
            .package(ScriptPackage::new("b").in_boundary("optional"));
        bundle.write();

        let manifest = Manifest::load(&bundle.source.join("bundle.yaml")).unwrap();
        assert_eq!(manifest.packages.len(), 2);
        assert_eq!(manifest.packages[1].rollback_boundary.as_deref(), Some("optional"));
    }
}
