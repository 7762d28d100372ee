//! Lifecycle events and the observer interface
//!
//! The engine reports every phase, package and cache step to a single
//! [`Observer`]. The observer's [`Reply`] is how a front-end cancels work,
//! asks for a retry, ignores a failure or overrides a planned request; the
//! engine never depends on how (or whether) the events are rendered.
//!
//! Only `*Begin` and progress events are cancelable. A cancel reply to any
//! other event is ignored.

pub mod console;

use crate::cache::CacheMessage;
use crate::domain::{ActionState, PackageState, RelationType, RequestState};
use crate::packages::Restart;

pub use console::ConsoleObserver;

/// One lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event<'a> {
    DetectBegin {
        packages: usize,
    },
    DetectRelatedBundle {
        bundle_id: &'a str,
        relation: RelationType,
        version: &'a semver::Version,
    },
    /// A newer version of this bundle is available
    DetectUpdate {
        location: &'a str,
        version: &'a str,
    },
    DetectPackageBegin {
        package_id: &'a str,
    },
    DetectPackageComplete {
        package_id: &'a str,
        state: PackageState,
        cached: bool,
        succeeded: bool,
    },
    DetectComplete {
        succeeded: bool,
    },

    PlanBegin {
        packages: usize,
    },
    PlanRelatedBundle {
        bundle_id: &'a str,
        relation: RelationType,
        action: ActionState,
    },
    /// Reply with [`Reply::Request`] to override `recommended`
    PlanPackageBegin {
        package_id: &'a str,
        recommended: RequestState,
    },
    PlanPackageComplete {
        package_id: &'a str,
        requested: RequestState,
        execute: ActionState,
        rollback: ActionState,
    },
    PlanComplete {
        succeeded: bool,
    },

    ApplyBegin {
        cache_actions: usize,
        execute_actions: usize,
    },
    Elevate,
    RegisterBegin,
    RegisterComplete {
        succeeded: bool,
    },
    CacheBegin {
        packages: usize,
    },
    CachePackageBegin {
        package_id: &'a str,
        payloads: usize,
    },
    /// A step of the cache pipeline for one payload or container
    CacheStep {
        id: &'a str,
        message: CacheMessage,
    },
    /// Reply with [`Reply::Retry`] to acquire the package again
    CachePackageComplete {
        package_id: &'a str,
        succeeded: bool,
    },
    CacheComplete {
        succeeded: bool,
    },
    ExecuteBegin {
        actions: usize,
    },
    ExecutePackageBegin {
        package_id: &'a str,
        action: ActionState,
        rollback: bool,
    },
    ExecuteProgress {
        package_id: &'a str,
        percent: u8,
    },
    /// Reply with [`Reply::Retry`] or [`Reply::Ignore`] to override a failure
    ExecutePackageComplete {
        package_id: &'a str,
        succeeded: bool,
        restart: Restart,
    },
    ExecuteComplete {
        succeeded: bool,
    },
    CleanPackage {
        package_id: &'a str,
    },
    UnregisterBegin,
    UnregisterComplete {
        succeeded: bool,
    },
    ApplyComplete {
        succeeded: bool,
        restart: Restart,
    },
}

impl Event<'_> {
    /// Whether a [`Reply::Cancel`] to this event is honored
    pub fn is_cancelable(&self) -> bool {
        match self {
            Event::DetectBegin { .. }
            | Event::DetectPackageBegin { .. }
            | Event::PlanBegin { .. }
            | Event::PlanPackageBegin { .. }
            | Event::ApplyBegin { .. }
            | Event::RegisterBegin
            | Event::CacheBegin { .. }
            | Event::CachePackageBegin { .. }
            | Event::ExecuteBegin { .. }
            | Event::ExecutePackageBegin { .. }
            | Event::ExecuteProgress { .. } => true,
            Event::CacheStep { message, .. } => matches!(
                message,
                CacheMessage::Begin(_) | CacheMessage::Progress { .. }
            ),
            _ => false,
        }
    }
}

/// Observer decision
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Reply {
    /// Accept the engine's recommendation
    #[default]
    Continue,
    Cancel,
    Retry,
    /// Treat a failed package as succeeded
    Ignore,
    /// Use this request instead of the recommended one
    Request(RequestState),
}

/// Receives lifecycle events; implemented by front-ends and test harnesses
pub trait Observer: Send {
    fn on_event(&mut self, event: &Event<'_>) -> Reply;
}

/// Observer that accepts every recommendation
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&mut self, _event: &Event<'_>) -> Reply {
        Reply::Continue
    }
}
