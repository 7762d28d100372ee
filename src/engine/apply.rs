//! Apply: carry out a plan
//!
//! Order of work:
//!
//! 1. take the machine-wide apply lock
//! 2. stage the engine and start the elevated companion when the plan has
//!    per-machine work
//! 3. register the bundle
//! 4. cache on a dedicated thread while executing on this one; without
//!    parallel caching the execute phase waits for the whole cache phase
//! 5. on failure remove what this apply cached for packages that are not
//!    installed; on success clean packages planned for removal
//! 6. unregister or save state, then release the companion

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, info, warn};

use super::Engine;
use super::cache_phase::{CacheOutcome, CacheSync};
use super::lock::ApplyLock;
use super::notifier::Notifier;
use super::plan::{CacheAction, Plan};
use super::retry::RetryTracker;
use super::router::Router;
use crate::cache::{Cache, CacheRemover, CacheTransaction};
use crate::config::{Manifest, UpdateSource};
use crate::domain::ActionState;
use crate::elevation::{ElevationContext, Request, RequestHandler};
use crate::error::{Result, engine::precondition};
use crate::events::{Event, Observer};
use crate::packages::Restart;
use crate::variables::{BUNDLE_ELEVATED, BUNDLE_LAST_USED_SOURCE, REBOOT_PENDING, Variables};

impl Engine {
    /// Apply the current plan. May run once per successful plan.
    pub fn apply(&mut self, observer: &mut dyn Observer) -> Result<Restart> {
        if self.applied {
            return Err(precondition("the plan was already applied; detect and plan again"));
        }
        let Some(plan) = self.plan.clone() else {
            return Err(precondition("apply requires a successful plan"));
        };
        self.applied = true;

        let notifier = Notifier::new(observer);
        let result = self.apply_plan(&plan, &notifier);
        let restart = result.as_ref().map_or(Restart::None, |r| *r);
        notifier.inform(&Event::ApplyComplete {
            succeeded: result.is_ok(),
            restart,
        });
        self.cache.remove_working_folder();

        match &result {
            Ok(restart) => info!(action = %plan.action, %restart, "apply complete"),
            Err(e) if e.is_user_exit() => info!(action = %plan.action, "apply canceled"),
            Err(e) => error!(action = %plan.action, error = %e, "apply failed"),
        }
        result
    }

    fn apply_plan(&mut self, plan: &Plan, notifier: &Notifier<'_>) -> Result<Restart> {
        notifier.notify(&Event::ApplyBegin {
            cache_actions: plan.cache_actions.len(),
            execute_actions: plan.execute_action_count(),
        })?;

        let _lock = ApplyLock::acquire(&self.lock_path)?;
        self.cache.ensure_base_working_folder(false)?;
        let launch_path = if plan.per_machine {
            self.cache
                .cache_bundle_engine(&self.engine_path, &self.manifest.bundle.executable_name)?
        } else {
            self.engine_path.clone()
        };

        let handler = RequestHandler::new(&self.manifest, &self.cache, &self.engines);
        let elevated = if plan.per_machine {
            notifier.inform(&Event::Elevate);
            let context = ElevationContext {
                handler,
                engine_path: &launch_path,
                manifest_path: &self.manifest_path,
                run_id: self.cache.run_id(),
                working_directory: self.command.working_directory.as_deref(),
            };
            let mut privileged = self.elevator.elevate(context)?;
            privileged.call(Request::ApplyInitialize, &mut crate::elevation::NoEvents)?;
            self.variables.set_bool(BUNDLE_ELEVATED, true);
            Some(privileged)
        } else {
            None
        };

        let mut run = ApplyRun {
            plan,
            manifest: &self.manifest,
            cache: &self.cache,
            notifier,
            router: Router::new(handler, elevated),
            variables: self.variables.clone(),
            engine_path: &launch_path,
            manifest_path: &self.manifest_path,
            update: self.update.as_ref(),
            update_path: Mutex::new(None),
            installed_before: self.installed,
            parallel: self.command.parallel_cache,
            disable_rollback: self.command.disable_rollback,
            retries: Mutex::new(RetryTracker::default()),
            installed_packages: Mutex::new(HashSet::new()),
            stop_cache: AtomicBool::new(false),
        };
        let result = run.run();
        let ApplyRun {
            router, variables, ..
        } = run;
        router.terminate();
        self.variables = variables;
        result
    }
}

/// State shared by the cache and execute threads for one apply
pub(super) struct ApplyRun<'a, 'o> {
    pub(super) plan: &'a Plan,
    pub(super) manifest: &'a Manifest,
    pub(super) cache: &'a Cache,
    pub(super) notifier: &'a Notifier<'o>,
    pub(super) router: Router<'a>,
    pub(super) variables: Variables,
    /// Engine binary registered and laid out; the staged copy when elevated
    pub(super) engine_path: &'a Path,
    pub(super) manifest_path: &'a Path,
    pub(super) update: Option<&'a UpdateSource>,
    pub(super) update_path: Mutex<Option<PathBuf>>,
    pub(super) installed_before: bool,
    pub(super) parallel: bool,
    pub(super) disable_rollback: bool,
    retries: Mutex<RetryTracker>,
    /// Packages whose last successful action left them installed
    installed_packages: Mutex<HashSet<String>>,
    stop_cache: AtomicBool,
}

impl ApplyRun<'_, '_> {
    pub(super) fn retries(&self) -> MutexGuard<'_, RetryTracker> {
        self.retries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the cache thread to stop after its current item
    pub(super) fn stop_caching(&self) {
        self.stop_cache.store(true, Ordering::SeqCst);
    }

    pub(super) fn caching_stopped(&self) -> bool {
        self.stop_cache.load(Ordering::SeqCst)
    }

    pub(super) fn record_executed(&self, package_id: &str, action: ActionState) {
        let mut installed = self
            .installed_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if action == ActionState::Uninstall {
            installed.remove(package_id);
        } else {
            installed.insert(package_id.to_string());
        }
    }

    fn run(&mut self) -> Result<Restart> {
        let (result, outcome) = match self.register() {
            Ok(()) => self.cache_and_execute(),
            Err(e) => (Err(e), CacheOutcome::default()),
        };
        let restart = result.as_ref().map_or(Restart::None, |r| *r);

        if result.is_err() {
            self.roll_back_cache(&outcome);
        }
        if let Some(folder) = &outcome.last_used_source {
            self.variables
                .set(BUNDLE_LAST_USED_SOURCE, folder.display().to_string());
        }
        if restart != Restart::None {
            self.variables.set_bool(REBOOT_PENDING, true);
        }
        if result.is_ok() && restart == Restart::None {
            self.clean();
        } else if !self.plan.clean_actions.is_empty() {
            debug!("clean actions skipped");
        }
        self.cleanup();
        self.finish_registration(result.is_ok(), restart);
        result
    }

    fn register(&self) -> Result<()> {
        if !self.plan.register {
            return Ok(());
        }
        let bundle = &self.manifest.bundle;
        self.notifier.notify(&Event::RegisterBegin)?;
        let result = self
            .router
            .call_quiet(
                bundle.per_machine,
                Request::SessionBegin {
                    engine_path: self.engine_path.to_path_buf(),
                    manifest_path: self.manifest_path.to_path_buf(),
                },
            )
            .and_then(|_| {
                self.router.call_quiet(
                    bundle.per_machine,
                    Request::SaveState {
                        variables: self.variables.clone(),
                    },
                )
            });
        self.notifier.inform(&Event::RegisterComplete {
            succeeded: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Run the cache thread and the execute phase; the cache thread is always
    /// joined before this returns
    fn cache_and_execute(&self) -> (Result<Restart>, CacheOutcome) {
        let sync = CacheSync::new(self.plan.cache_actions.iter().map(CacheAction::key));

        std::thread::scope(|scope| {
            let mut outcome = CacheOutcome::default();
            let mut cache_thread = None;
            if !self.plan.cache_actions.is_empty() {
                let spawned = std::thread::Builder::new()
                    .name("cache".to_string())
                    .spawn_scoped(scope, || self.run_cache_phase(&sync));
                match spawned {
                    Ok(handle) if self.parallel => cache_thread = Some(handle),
                    Ok(handle) => outcome = handle.join().into(),
                    Err(e) => {
                        warn!(error = %e, "failed to start the cache thread; caching inline");
                        outcome = self.run_cache_phase(&sync);
                    }
                }
            }

            let executed = if outcome.failed() {
                None
            } else {
                Some(self.run_execute_phase(&sync))
            };
            if let Some(handle) = cache_thread {
                outcome = handle.join().into();
            }

            let cached = outcome.result.take().unwrap_or(Ok(()));
            let result = match (cached, executed) {
                (Err(e), _) => Err(e),
                (Ok(()), Some(executed)) => executed,
                (Ok(()), None) => Ok(Restart::None),
            };
            (result, outcome)
        })
    }

    /// Remove package directories this apply created for packages that did
    /// not end up installed
    fn roll_back_cache(&self, outcome: &CacheOutcome) {
        let mut transaction = CacheTransaction::new(self);
        if self.disable_rollback {
            transaction.disable_rollback();
        }
        for (per_machine, cache_id) in &outcome.created {
            transaction.track_created(*per_machine, cache_id.clone());
        }
        let installed = self
            .installed_packages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for package in self.manifest.packages.iter().filter(|p| installed.contains(&p.id)) {
            transaction.keep(&package.cache_id);
        }
        if let Err(e) = transaction.rollback() {
            warn!(error = %e, "failed to remove cached packages");
        }
    }

    fn clean(&self) {
        for clean in &self.plan.clean_actions {
            let Some(package) = self.manifest.package(&clean.package_id) else {
                continue;
            };
            self.notifier.inform(&Event::CleanPackage {
                package_id: &package.id,
            });
            if let Err(e) = self.router.call_quiet(
                package.per_machine,
                Request::CacheRemovePackage {
                    package_id: package.id.clone(),
                },
            ) {
                warn!(package = %package.id, error = %e, "failed to clean package");
            }
        }
    }

    fn cleanup(&self) {
        let mut scopes = vec![false];
        if self.router.is_elevated() {
            scopes.push(true);
        }
        for per_machine in scopes {
            if let Err(e) = self
                .router
                .call_quiet(per_machine, Request::CacheCleanup { per_machine })
            {
                warn!(per_machine, error = %e, "cache cleanup failed");
            }
        }
    }

    /// Unregister when nothing of the bundle should remain, else save state
    fn finish_registration(&self, succeeded: bool, restart: Restart) {
        let bundle = &self.manifest.bundle;
        let unregister = (!succeeded && self.plan.register && !self.installed_before)
            || (succeeded && self.plan.unregister && restart == Restart::None);

        if unregister {
            self.notifier.inform(&Event::UnregisterBegin);
            let result = self
                .router
                .call_quiet(bundle.per_machine, Request::SessionEnd { unregister: true });
            if let Err(e) = &result {
                warn!(bundle = %bundle.id, error = %e, "failed to unregister bundle");
            }
            self.notifier.inform(&Event::UnregisterComplete {
                succeeded: result.is_ok(),
            });
        } else if self.plan.register || self.installed_before {
            if let Err(e) = self.router.call_quiet(
                bundle.per_machine,
                Request::SaveState {
                    variables: self.variables.clone(),
                },
            ) {
                warn!(bundle = %bundle.id, error = %e, "failed to save state");
            }
        }
    }
}

impl CacheRemover for ApplyRun<'_, '_> {
    fn remove_package(&self, per_machine: bool, cache_id: &str) -> Result<()> {
        match self
            .manifest
            .packages
            .iter()
            .find(|p| p.cache_id == cache_id && p.per_machine == per_machine)
        {
            Some(package) => self
                .router
                .call_quiet(
                    per_machine,
                    Request::CacheRemovePackage {
                        package_id: package.id.clone(),
                    },
                )
                .map(|_| ()),
            None => self.cache.remove_package(per_machine, cache_id),
        }
    }
}
