//! Apply orchestrator
//!
//! [`Engine`] owns the manifest, the cache and the variables for one run and
//! drives the Detect → Plan → Apply state machine:
//!
//! - [`Engine::detect`] records what is on the machine
//! - [`Engine::plan`] turns that and the requested action into a [`Plan`]
//! - [`Engine::apply`] carries the plan out, elevating when per-machine work
//!   is planned
//!
//! Each phase reports to an [`Observer`](crate::events::Observer) passed by
//! reference for the duration of the call.

mod apply;
mod cache_phase;
mod detect;
mod execute;
pub mod lock;
pub mod notifier;
pub mod plan;
pub mod registration;
pub mod related;
pub mod retry;
mod router;
pub mod search;

use std::path::{Path, PathBuf};

use tracing::{debug, info};

pub use lock::{ApplyLock, default_lock_path};
pub use plan::{BoundaryPlan, CacheAction, CleanAction, ExecuteAction, Plan};
pub use crate::domain::RelatedBundle;

use crate::cache::Cache;
use crate::config::{EngineCommand, MachinePolicy, Manifest, UpdateSource};
use crate::elevation::{ElevationContext, Elevator, NoEvents, Request, RequestHandler, Response, default_elevator};
use crate::error::{Result, engine::protocol};
use crate::packages::PackageEngines;
use crate::variables::{BUNDLE_ACTION, BUNDLE_VERSION, Variables};

/// One run of the bootstrapper over a manifest
pub struct Engine {
    manifest: Manifest,
    manifest_path: PathBuf,
    engine_path: PathBuf,
    command: EngineCommand,
    policy: MachinePolicy,
    cache: Cache,
    variables: Variables,
    engines: PackageEngines,
    elevator: Box<dyn Elevator>,
    lock_path: PathBuf,
    related: Vec<RelatedBundle>,
    update: Option<UpdateSource>,
    /// A registration record for this bundle existed at detect
    installed: bool,
    detected: bool,
    /// Apply ran since the last plan; machine state may have changed
    applied: bool,
    plan: Option<Plan>,
}

impl Engine {
    /// Create an engine with a cache resolved from the machine's known folders
    pub fn new(
        manifest: Manifest,
        manifest_path: impl Into<PathBuf>,
        command: EngineCommand,
        policy: MachinePolicy,
    ) -> Result<Self> {
        let cache = Cache::initialize(&command, &policy)?;
        Self::with_cache(manifest, manifest_path, command, policy, cache)
    }

    /// Create an engine over an existing cache
    pub fn with_cache(
        manifest: Manifest,
        manifest_path: impl Into<PathBuf>,
        command: EngineCommand,
        policy: MachinePolicy,
        mut cache: Cache,
    ) -> Result<Self> {
        let manifest_path = manifest_path.into();
        let engine_path = match &command.engine_path {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };

        let mut variables = Variables::new();
        variables.fill_from(&manifest.variables);
        if let Some(saved) = registration::load_state(&cache, &manifest.bundle)? {
            debug!(bundle = %manifest.bundle.id, "restored saved state");
            variables.merge(&saved);
        }
        variables.set(BUNDLE_ACTION, command.action.to_string());
        variables.set(BUNDLE_VERSION, manifest.bundle.version.clone());
        cache.initialize_sources(&manifest.bundle, &mut variables, &command)?;

        info!(
            bundle = %manifest.bundle.id,
            version = %manifest.bundle.version,
            action = %command.action,
            "engine initialized"
        );

        let elevator = default_elevator(&policy);
        Ok(Self {
            manifest,
            manifest_path,
            engine_path,
            command,
            policy,
            cache,
            variables,
            engines: PackageEngines::default(),
            elevator,
            lock_path: default_lock_path(),
            related: Vec::new(),
            update: None,
            installed: false,
            detected: false,
            applied: false,
            plan: None,
        })
    }

    pub fn with_elevator(mut self, elevator: Box<dyn Elevator>) -> Self {
        self.elevator = elevator;
        self
    }

    pub fn with_package_engines(mut self, engines: PackageEngines) -> Self {
        self.engines = engines;
        self
    }

    /// Use a different cross-process apply lock file
    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn command(&self) -> &EngineCommand {
        &self.command
    }

    pub fn policy(&self) -> &MachinePolicy {
        &self.policy
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    /// Related bundles found by the last detect
    pub fn related(&self) -> &[RelatedBundle] {
        &self.related
    }

    /// The newer bundle found by the last detect, if any
    pub fn update(&self) -> Option<&UpdateSource> {
        self.update.as_ref()
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    pub fn current_plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    /// Launch an executable the manifest approves, elevated for a
    /// per-machine bundle. Returns the child's pid.
    pub fn launch_approved_exe(&mut self, id: &str) -> Result<u32> {
        let request = Request::LaunchApprovedExe {
            id: id.to_string(),
            variables: self.variables.clone(),
        };

        let response = if self.manifest.bundle.per_machine {
            self.cache.ensure_base_working_folder(false)?;
            let launch_path = self
                .cache
                .cache_bundle_engine(&self.engine_path, &self.manifest.bundle.executable_name)?;
            let handler = RequestHandler::new(&self.manifest, &self.cache, &self.engines);
            let mut privileged = self.elevator.elevate(ElevationContext {
                handler,
                engine_path: &launch_path,
                manifest_path: &self.manifest_path,
                run_id: self.cache.run_id(),
                working_directory: self.command.working_directory.as_deref(),
            })?;
            let response = privileged.call(request, &mut NoEvents);
            if let Err(e) = privileged.terminate() {
                tracing::warn!(error = %e, "failed to release the elevated companion");
            }
            response?
        } else {
            RequestHandler::new(&self.manifest, &self.cache, &self.engines).handle(request, &mut NoEvents)?
        };

        match response {
            Response::Launched { pid } => {
                info!(id, pid, "approved executable launched");
                Ok(pid)
            }
            other => Err(protocol(format!("unexpected response to launch: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests;
