use super::*;
use crate::domain::RegistrationRecord;
use crate::engine::registration::RegistrationStore;
use crate::engine::tests::{Fixture, Recorder};
use crate::error::BootstrapError;
use crate::events::NullObserver;

fn package_ids(plan: &Plan) -> Vec<String> {
    plan.execute_actions()
        .map(|action| match action {
            ExecuteAction::Package {
                package_id, action, ..
            } => format!("{package_id}:{action}"),
            ExecuteAction::RelatedBundle {
                bundle_id, action, ..
            } => format!("related {bundle_id}:{action}"),
            ExecuteAction::Update => "update".to_string(),
        })
        .collect()
}

fn planned(fixture: &Fixture, yaml: &str, action: BundleAction) -> Plan {
    let mut engine = fixture.engine(yaml, action);
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap().clone()
}

#[test]
fn test_install_plan_keeps_authored_order() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0), ("c", 0)], "");

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert_eq!(package_ids(&plan), vec!["a:install", "b:install", "c:install"]);
    assert_eq!(plan.cache_package_count(), 3);
    assert!(plan.register);
    assert!(!plan.unregister);
    assert!(!plan.per_machine);
    assert_eq!(plan.boundaries.len(), 1);
    assert!(plan.boundaries[0].vital);
    assert_eq!(
        plan.boundaries[0].actions[0],
        ExecuteAction::Package {
            package_id: "a".to_string(),
            action: ActionState::Install,
            rollback: ActionState::Uninstall,
        }
    );
}

#[test]
fn test_present_packages_are_left_alone() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0)], "");
    std::fs::write(fixture.marker("a"), b"").unwrap();

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert_eq!(package_ids(&plan), vec!["b:install"]);
}

#[test]
fn test_uninstall_reverses_order() {
    let fixture = Fixture::new();
    let extra = "rollback_boundaries:\n  - { id: tail, vital: false }\n";
    let mut yaml = fixture.script_packages(&[("a", 0), ("b", 0), ("c", 0)], extra);
    yaml = yaml.replace("  - id: c\n", "  - id: c\n    rollback_boundary: tail\n");
    for id in ["a", "b", "c"] {
        std::fs::write(fixture.marker(id), b"").unwrap();
    }

    let plan = planned(&fixture, &yaml, BundleAction::Uninstall);

    assert_eq!(package_ids(&plan), vec!["c:uninstall", "b:uninstall", "a:uninstall"]);
    assert_eq!(plan.boundaries[0].id.as_deref(), Some("tail"));
    assert_eq!(plan.boundaries[1].id, None);
    assert!(plan.unregister);
    assert!(!plan.register);
    assert_eq!(plan.clean_actions.len(), 3);
}

#[test]
fn test_boundaries_split_at_authored_packages() {
    let fixture = Fixture::new();
    let extra = "rollback_boundaries:\n  - { id: optional, vital: false, transaction: true }\n";
    let yaml = fixture
        .script_packages(&[("a", 0), ("b", 0), ("c", 0)], extra)
        .replace("  - id: b\n", "  - id: b\n    rollback_boundary: optional\n");

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert_eq!(plan.boundaries.len(), 2);
    assert_eq!(plan.boundaries[0].id, None);
    assert_eq!(plan.boundaries[0].actions.len(), 1);
    let optional = &plan.boundaries[1];
    assert_eq!(optional.id.as_deref(), Some("optional"));
    assert!(!optional.vital);
    assert!(optional.transaction);
    assert_eq!(optional.actions.len(), 2);
}

#[test]
fn test_empty_implicit_boundary_is_dropped() {
    let fixture = Fixture::new();
    let extra = "rollback_boundaries:\n  - { id: first }\n";
    let yaml = fixture
        .script_packages(&[("a", 0)], extra)
        .replace("  - id: a\n", "  - id: a\n    rollback_boundary: first\n");

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert_eq!(plan.boundaries.len(), 1);
    assert_eq!(plan.boundaries[0].id.as_deref(), Some("first"));
}

#[test]
fn test_newer_installed_version_is_a_downgrade() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let engine = fixture.engine(&yaml, BundleAction::Install);
    RegistrationStore::for_scope(engine.cache().roots(), false)
        .write(&RegistrationRecord {
            id: "suite-3".to_string(),
            name: "Suite".to_string(),
            version: "3.0.0".to_string(),
            upgrade_code: Some("suite".to_string()),
            per_machine: false,
            cache_id: "suite-3".to_string(),
            executable_name: "setup".to_string(),
            addon_for: vec![],
            patch_for: vec![],
        })
        .unwrap();

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert!(plan.downgrade);
    assert!(!plan.register);
    assert_eq!(plan.execute_action_count(), 0);
}

#[test]
fn test_older_installed_version_is_removed_last() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let engine = fixture.engine(&yaml, BundleAction::Install);
    RegistrationStore::for_scope(engine.cache().roots(), false)
        .write(&RegistrationRecord {
            id: "suite-1".to_string(),
            name: "Suite".to_string(),
            version: "1.0.0".to_string(),
            upgrade_code: Some("suite".to_string()),
            per_machine: false,
            cache_id: "suite-1".to_string(),
            executable_name: "setup".to_string(),
            addon_for: vec![],
            patch_for: vec![],
        })
        .unwrap();

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert_eq!(package_ids(&plan), vec!["a:install", "related suite-1:uninstall"]);
    assert!(!plan.downgrade);
}

#[test]
fn test_observer_overrides_request() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0), ("b", 0)], "");
    let mut engine = fixture.engine(&yaml, BundleAction::Install);
    engine.detect(&mut NullObserver).unwrap();
    let mut recorder = Recorder::replying(|event| match event {
        Event::PlanPackageBegin { package_id: "b", .. } => Reply::Request(RequestState::None),
        _ => Reply::Continue,
    });

    let plan = engine.plan(&mut recorder).unwrap();

    assert_eq!(package_ids(plan), vec!["a:install"]);
    assert_eq!(recorder.count("PlanPackageComplete"), 2);
}

#[test]
fn test_layout_requires_directory() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");

    let mut engine = fixture.engine(&yaml, BundleAction::Layout);
    engine.detect(&mut NullObserver).unwrap();
    let err = engine.plan(&mut NullObserver).unwrap_err();
    assert!(matches!(err, BootstrapError::PreconditionFailed { .. }));

    let directory = fixture.temp.path().join("layout");
    let mut command = fixture.command(BundleAction::Layout);
    command.layout_directory = Some(directory.clone());
    let mut engine = fixture.engine_with(&yaml, command);
    engine.detect(&mut NullObserver).unwrap();
    let plan = engine.plan(&mut NullObserver).unwrap();
    assert_eq!(plan.cache_actions, vec![CacheAction::Layout { directory }]);
    assert!(!plan.register);
    assert_eq!(plan.execute_action_count(), 0);
}

#[test]
fn test_update_replace_requires_newer_bundle() {
    let fixture = Fixture::new();
    let yaml = fixture.script_packages(&[("a", 0)], "");
    let mut engine = fixture.engine(&yaml, BundleAction::UpdateReplace);
    engine.detect(&mut NullObserver).unwrap();
    assert!(engine.plan(&mut NullObserver).is_err());

    let yaml = fixture.script_packages(
        &[("a", 0)],
        "update: { location: https://example.invalid/suite-3, version: 3.0.0 }\n",
    );
    let mut engine = fixture.engine(&yaml, BundleAction::UpdateReplace);
    engine.detect(&mut NullObserver).unwrap();
    let plan = engine.plan(&mut NullObserver).unwrap();
    assert_eq!(plan.cache_actions, vec![CacheAction::Update]);
    assert_eq!(package_ids(plan), vec!["update"]);
}

#[test]
fn test_per_machine_package_needs_elevation() {
    let fixture = Fixture::new();
    let yaml = fixture
        .script_packages(&[("a", 0), ("b", 0)], "")
        .replace("  - id: b\n", "  - id: b\n    per_machine: true\n");

    let plan = planned(&fixture, &yaml, BundleAction::Install);

    assert!(plan.per_machine);
}
