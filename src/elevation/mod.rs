//! Elevation hand-off
//!
//! Per-machine work runs in a privileged companion: a second instance of the
//! engine binary started through the policy's elevation launcher (`sudo -n`
//! by default on Unix). The companion connects back to a loopback listener
//! with two connections, an RPC channel and a one-way log channel, each
//! verified with a per-run secret and the parent's pid.
//!
//! The orchestrator only sees [`Privileged`]: [`ProcessCompanion`] forwards
//! requests over the RPC channel, [`LocalPrivileged`] runs them in-process
//! when the primary already holds the privileges.

pub mod channel;
pub mod companion;
pub mod handler;
pub mod log_pump;
pub mod process;
pub mod protocol;

use std::path::Path;

pub use handler::{NoEvents, RequestEvents, RequestHandler};
pub use process::{ProcessCompanion, ProcessElevator};
pub use protocol::{Request, Response};

use crate::config::MachinePolicy;
use crate::error::Result;

/// A connection to something that can perform privileged requests
pub trait Privileged: Send {
    fn call(&mut self, request: Request, events: &mut dyn RequestEvents) -> Result<Response>;

    /// Release the companion; further calls fail
    fn terminate(&mut self) -> Result<()>;
}

/// What an elevator needs to start a companion for this run
#[derive(Clone, Copy)]
pub struct ElevationContext<'a> {
    /// In-process handler over the primary's manifest and cache
    pub handler: RequestHandler<'a>,
    /// Staged copy of the engine binary to launch
    pub engine_path: &'a Path,
    pub manifest_path: &'a Path,
    /// Shared so the companion's working folder carries the same name
    pub run_id: &'a str,
    pub working_directory: Option<&'a Path>,
}

/// Obtains a [`Privileged`] connection
pub trait Elevator: Send + Sync {
    fn elevate<'a>(&self, context: ElevationContext<'a>) -> Result<Box<dyn Privileged + 'a>>;
}

/// Runs privileged requests in the current process
pub struct LocalPrivileged<'a> {
    handler: RequestHandler<'a>,
}

impl<'a> LocalPrivileged<'a> {
    pub fn new(handler: RequestHandler<'a>) -> Self {
        Self { handler }
    }
}

impl Privileged for LocalPrivileged<'_> {
    fn call(&mut self, request: Request, events: &mut dyn RequestEvents) -> Result<Response> {
        self.handler.handle(request, events)
    }

    fn terminate(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Elevator for a process that already holds the privileges it needs
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessElevator;

impl Elevator for InProcessElevator {
    fn elevate<'a>(&self, context: ElevationContext<'a>) -> Result<Box<dyn Privileged + 'a>> {
        tracing::debug!("already privileged, serving per-machine requests in-process");
        Ok(Box::new(LocalPrivileged::new(context.handler)))
    }
}

/// Whether this process already runs with administrative privileges
pub fn is_privileged() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Elevator for this machine: in-process when already privileged, otherwise
/// a companion started through the policy launcher
pub fn default_elevator(policy: &MachinePolicy) -> Box<dyn Elevator> {
    if is_privileged() {
        Box::new(InProcessElevator)
    } else {
        Box::new(ProcessElevator::from_policy(policy))
    }
}
