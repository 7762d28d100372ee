//! Engine tests over a throwaway cache and source folder

use std::path::PathBuf;

use tempfile::TempDir;

use super::*;
use crate::cache::{KnownFolders, RetryPolicy};
use crate::config::BundleAction;
use crate::domain::PackageState;
use crate::error::BootstrapError;
use crate::events::{Event, NullObserver, Observer, Reply};
use crate::hash::hash_bytes;
use crate::packages::Restart;

type ReplyFn = Box<dyn FnMut(&Event<'_>) -> Reply + Send>;

/// Observer that records every event and answers with a closure
pub(crate) struct Recorder {
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

    pub fn count(&self, prefix: &str) -> usize {
        self.events.iter().filter(|e| e.starts_with(prefix)).count()
    }
}

impl Observer for Recorder {
    fn on_event(&mut self, event: &Event<'_>) -> Reply {
        self.events.push(format!("{event:?}"));
        (self.reply)(event)
    }
}

/// A source folder with an engine binary, payloads and a manifest, plus
/// cache roots, all under one temp dir
pub(crate) struct Fixture {
    pub temp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("source")).unwrap();
        std::fs::write(temp.path().join("source").join("setup"), b"engine").unwrap();
        Self { temp }
    }

    pub fn source(&self) -> PathBuf {
        self.temp.path().join("source")
    }

    pub fn folders(&self) -> KnownFolders {
        KnownFolders {
            per_machine_data: self.temp.path().join("machine"),
            per_user_data: self.temp.path().join("user"),
        }
    }

    /// Write a source payload and return its digest
    pub fn payload(&self, name: &str, contents: &str) -> String {
        std::fs::write(self.source().join(name), contents).unwrap();
        hash_bytes(contents.as_bytes())
    }

    pub fn log_path(&self) -> PathBuf {
        self.temp.path().join("packages.log")
    }

    /// Write an exe package script that logs `<id> <action>`, keeps a marker
    /// file for detection and exits with `code`. Returns its digest.
    pub fn script(&self, id: &str, code: i32) -> String {
        let marker = self.marker(id);
        let body = format!(
            "#!/bin/sh\necho \"{id} $1\" >> \"{log}\"\ncase \"$1\" in\n  install) touch \"{marker}\" ;;\n  uninstall) rm -f \"{marker}\" ;;\nesac\nexit {code}\n",
            log = self.log_path().display(),
            marker = marker.display(),
        );
        self.payload(&format!("{id}.sh"), &body)
    }

    pub fn marker(&self, id: &str) -> PathBuf {
        self.temp.path().join(format!("{id}.installed"))
    }

    /// Lines written by package scripts so far
    pub fn log(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Manifest yaml for exe packages backed by [`Fixture::script`]
    pub fn script_packages(&self, packages: &[(&str, i32)], extra: &str) -> String {
        let mut payloads = String::new();
        let mut entries = String::new();
        for (id, code) in packages {
            let hash = self.script(id, *code);
            payloads.push_str(&format!(
                "  - {{ key: {id}, file_path: {id}.sh, verification: {{ kind: hash, hash: {hash} }} }}\n"
            ));
            entries.push_str(&format!(
                "  - id: {id}\n    kind: exe\n    cache_id: {id}-1\n    payloads: [{id}]\n    install_arguments: [install]\n    uninstall_arguments: [uninstall]\n    detect: {{ kind: path_exists, path: '{marker}' }}\n",
                marker = self.marker(id).display(),
            ));
        }
        format!(
            "bundle: {{ id: suite, name: Suite, version: 2.0.0, upgrade_code: suite, cache_id: suite-2 }}\npayloads:\n{payloads}packages:\n{entries}{extra}"
        )
    }

    pub fn command(&self, action: BundleAction) -> EngineCommand {
        EngineCommand {
            action,
            working_directory: Some(self.temp.path().join("work")),
            engine_path: Some(self.source().join("setup")),
            ..EngineCommand::default()
        }
    }

    pub fn engine(&self, yaml: &str, action: BundleAction) -> Engine {
        self.engine_with(yaml, self.command(action))
    }

    pub fn engine_with(&self, yaml: &str, command: EngineCommand) -> Engine {
        let manifest_path = self.source().join("bundle.yaml");
        std::fs::write(&manifest_path, yaml).unwrap();
        let manifest = Manifest::from_yaml(yaml).unwrap();
        let policy = MachinePolicy::default();
        let cache = Cache::with_folders(&self.folders(), &command, &policy).with_retry(RetryPolicy::immediate(1));
        Engine::with_cache(manifest, manifest_path, command, policy, cache)
            .unwrap()
            .with_elevator(Box::new(crate::elevation::InProcessElevator))
            .with_lock_path(self.temp.path().join("apply.lock"))
    }
}

#[test]
fn test_plan_requires_detect() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let mut engine = fixture.engine(&yaml, BundleAction::Install);

    let err = engine.plan(&mut NullObserver).unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailed { .. }));
}

#[test]
fn test_apply_requires_plan() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let mut engine = fixture.engine(&yaml, BundleAction::Install);
    engine.detect(&mut NullObserver).unwrap();

    let err = engine.apply(&mut NullObserver).unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailed { .. }));
}

#[test]
fn test_engine_variables() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "variables:\n  InstallDir: /opt/suite\n");
    let engine = fixture.engine(&yaml, BundleAction::Repair);

    assert_eq!(engine.variables().get("InstallDir"), Some("/opt/suite"));
    assert_eq!(engine.variables().get(BUNDLE_ACTION), Some("repair"));
    assert_eq!(engine.variables().get(BUNDLE_VERSION), Some("2.0.0"));
    assert!(engine.variables().contains(crate::variables::BUNDLE_ORIGINAL_SOURCE));
}

#[test]
fn test_saved_state_is_restored() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let engine = fixture.engine(&yaml, BundleAction::Install);

    let mut saved = Variables::new();
    saved.set("Chosen", "full");
    registration::save_state(engine.cache(), &engine.manifest().bundle, &saved).unwrap();

    let engine = fixture.engine(&yaml, BundleAction::Modify);
    assert_eq!(engine.variables().get("Chosen"), Some("full"));
}

#[test]
fn test_detect_reports_state_per_package() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0)], "");
    std::fs::write(fixture.marker("b"), b"").unwrap();
    let mut engine = fixture.engine(&yaml, BundleAction::Install);
    let mut recorder = Recorder::new();

    engine.detect(&mut recorder).unwrap();

    let states: Vec<PackageState> = engine.manifest().packages.iter().map(|p| p.current_state).collect();
    assert_eq!(states, vec![PackageState::Absent, PackageState::Present]);
    assert!(!engine.is_installed());
    assert_eq!(recorder.count("DetectPackageComplete"), 2);
}

#[test]
fn test_detect_cancel_stops_detection() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0)], "");
    let mut engine = fixture.engine(&yaml, BundleAction::Install);
    let mut recorder = Recorder::replying(|event| match event {
        Event::DetectPackageBegin { .. } => Reply::Cancel,
        _ => Reply::Continue,
    });

    let err = engine.detect(&mut recorder).unwrap_err();
    assert!(err.is_user_exit());
    assert_eq!(recorder.count("DetectPackageBegin"), 1);
    assert!(engine.plan(&mut NullObserver).is_err());
}

#[cfg(unix)]
#[test]
fn test_install_then_uninstall() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0)], "");

    let mut engine = fixture.engine(&yaml, BundleAction::Install);
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap();
    assert_eq!(engine.apply(&mut NullObserver).unwrap(), Restart::None);
    assert_eq!(fixture.log(), vec!["a install", "b install"]);
    assert!(fixture.marker("a").exists());

    let err = engine.apply(&mut NullObserver).unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailed { .. }));

    let mut engine = fixture.engine(&yaml, BundleAction::Uninstall);
    engine.detect(&mut NullObserver).unwrap();
    assert!(engine.is_installed());
    engine.plan(&mut NullObserver).unwrap();
    engine.apply(&mut NullObserver).unwrap();

    assert_eq!(
        fixture.log(),
        vec!["a install", "b install", "b uninstall", "a uninstall"]
    );
    let registration = registration::RegistrationStore::for_scope(engine.cache().roots(), false);
    assert!(registration.read("suite").unwrap().is_none());
    assert!(!engine.cache().completed_path(false, "a-1").path.exists());
}

#[cfg(unix)]
#[test]
fn test_launch_approved_exe() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(
        &[("a", 0)],
        "approved_exes:\n  - { id: shell, path: /bin/sh, arguments: [-c, 'exit 0'] }\n",
    );
    let mut engine = fixture.engine(&yaml, BundleAction::Install);

    let pid = engine.launch_approved_exe("shell").unwrap();
    assert!(pid > 0);

    let err = engine.launch_approved_exe("unknown").unwrap_err();
    assert!(err.to_string().contains("not an approved executable"));
}
