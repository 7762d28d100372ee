//! Cancellation and the machine-wide apply lock

#![cfg(unix)]

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use bootstrapper::config::BundleAction;
use bootstrapper::engine::ApplyLock;
use bootstrapper::engine::registration::RegistrationStore;
use bootstrapper::events::{Event, NullObserver, Reply};
use common::{Recorder, ScriptPackage, TestBundle};

#[test]
fn test_cancel_during_cache_stops_before_execute() {
    let bundle = TestBundle::new()
        .package(ScriptPackage::new("a"))
        .package(ScriptPackage::new("b"));
    bundle.write();

    let mut engine = bundle.engine(bundle.command(BundleAction::Install));
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap();
    let mut recorder = Recorder::replying(|event| match event {
        Event::CachePackageBegin { package_id: "b", .. } => Reply::Cancel,
        _ => Reply::Continue,
    });

    let err = engine.apply(&mut recorder).unwrap_err();

    assert!(err.is_user_exit());
    assert!(bundle.log().is_empty());
    assert!(!engine.cache().completed_path(false, "a-1").path.exists());
    let store = RegistrationStore::for_scope(engine.cache().roots(), false);
    assert!(store.read("suite").unwrap().is_none());
    assert!(recorder.contains("ApplyComplete { succeeded: false"));
}

#[test]
fn test_cancel_at_execute_rolls_back_boundary() {
    let bundle = TestBundle::new()
        .package(ScriptPackage::new("a"))
        .package(ScriptPackage::new("b"));
    bundle.write();

    let mut engine = bundle.engine(bundle.command(BundleAction::Install));
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap();
    let mut recorder = Recorder::replying(|event| match event {
        Event::ExecutePackageBegin {
            package_id: "b",
            rollback: false,
            ..
        } => Reply::Cancel,
        _ => Reply::Continue,
    });

    let err = engine.apply(&mut recorder).unwrap_err();

    assert!(err.is_user_exit());
    // The canceled package is rolled back too, before the ones already run
    assert_eq!(bundle.log(), vec!["a install", "b uninstall", "a uninstall"]);
    assert!(!bundle.marker("a").exists());
    assert!(!bundle.marker("b").exists());
}

#[test]
fn test_apply_waits_for_lock() {
    let bundle = TestBundle::new().package(ScriptPackage::new("a"));
    bundle.write();
    let lock_path = bundle.path().join("apply.lock");
    let held = ApplyLock::acquire(&lock_path).unwrap();

    let mut engine = bundle.engine(bundle.command(BundleAction::Install));
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap();

    let (sender, receiver) = mpsc::channel();
    let worker = thread::spawn(move || {
        let result = engine.apply(&mut NullObserver);
        sender.send(()).unwrap();
        result
    });

    assert!(receiver.recv_timeout(Duration::from_millis(300)).is_err());
    assert!(bundle.log().is_empty());

    drop(held);
    receiver.recv_timeout(Duration::from_secs(30)).unwrap();
    worker.join().unwrap().unwrap();
    assert_eq!(bundle.log(), vec!["a install"]);
}

#[test]
fn test_parallel_cancel_during_rollback_still_rolls_back() {
    let bundle = TestBundle::new()
        .package(ScriptPackage::new("a"))
        .package(ScriptPackage::new("b"))
        .package(ScriptPackage::new("c"));
    bundle.write();

    let mut command = bundle.command(BundleAction::Install);
    command.parallel_cache = true;
    let mut engine = bundle.engine(command);
    engine.detect(&mut NullObserver).unwrap();
    engine.plan(&mut NullObserver).unwrap();
    // Cancel at b, then keep answering cancel to every rollback step
    let mut recorder = Recorder::replying(|event| match event {
        Event::ExecutePackageBegin { package_id: "b", .. }
        | Event::ExecutePackageBegin { rollback: true, .. } => Reply::Cancel,
        _ => Reply::Continue,
    });

    let err = engine.apply(&mut recorder).unwrap_err();

    assert!(err.is_user_exit());
    assert_eq!(bundle.log(), vec!["a install", "b uninstall", "a uninstall"]);
    assert!(!bundle.marker("a").exists());
    assert!(!engine.cache().completed_path(false, "c-1").path.exists());
    assert!(recorder.contains("ApplyComplete { succeeded: false"));
}
