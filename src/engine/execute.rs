//! Execute phase: run planned actions boundary by boundary
//!
//! A vital failure, or a cancel, rolls back everything already executed in
//! the current rollback boundary (newest first, the failed package included)
//! and stops there. Inside a vital boundary that fails the apply; a
//! non-vital boundary is abandoned and execution continues with the next one.
//! Non-vital packages may fail without consequence unless their boundary is
//! a transaction, where every failure rolls the boundary back.

use std::sync::PoisonError;

use tracing::{debug, info, warn};

use super::apply::ApplyRun;
use super::cache_phase::CacheSync;
use super::plan::{BoundaryPlan, ExecuteAction, UPDATE_KEY};
use super::router::{ObserverEvents, expect_restart};
use crate::config::BundleAction;
use crate::domain::{ActionState, RelationType, RestartExitCodes};
use crate::elevation::Request;
use crate::error::{Result, engine::precondition};
use crate::events::{Event, Reply};
use crate::packages::Restart;
use crate::packages::bundle::{child_arguments, run_bootstrapper};

impl ApplyRun<'_, '_> {
    pub(super) fn run_execute_phase(&self, sync: &CacheSync) -> Result<Restart> {
        let total = self.plan.execute_action_count();
        if total == 0 {
            return Ok(Restart::None);
        }

        let result = self
            .notifier
            .notify(&Event::ExecuteBegin { actions: total })
            .and_then(|_| self.execute_boundaries(sync));
        self.notifier.inform(&Event::ExecuteComplete {
            succeeded: result.is_ok(),
        });
        if result.is_err() {
            self.stop_caching();
        }
        result
    }

    fn execute_boundaries(&self, sync: &CacheSync) -> Result<Restart> {
        let mut restart = Restart::None;
        for boundary in &self.plan.boundaries {
            restart = restart.max(self.execute_boundary(boundary, sync)?);
            if restart == Restart::Initiated {
                info!("restart initiated; remaining actions skipped");
                break;
            }
        }
        Ok(restart)
    }

    fn execute_boundary(&self, boundary: &BoundaryPlan, sync: &CacheSync) -> Result<Restart> {
        debug!(
            boundary = boundary.id.as_deref().unwrap_or("<implicit>"),
            vital = boundary.vital,
            transaction = boundary.transaction,
            actions = boundary.actions.len(),
            "entering rollback boundary"
        );

        let mut executed: Vec<&ExecuteAction> = Vec::new();
        let mut restart = Restart::None;
        for action in &boundary.actions {
            if let Err(e) = self.notifier.check_canceled() {
                self.roll_back(boundary, &executed, None);
                return Err(e);
            }

            match self.execute_action(action, sync) {
                Ok(outcome) => {
                    restart = restart.max(outcome);
                    executed.push(action);
                    if outcome == Restart::Initiated {
                        break;
                    }
                }
                Err(e) if !e.is_user_exit() && !boundary.transaction && !self.is_vital(action) => {
                    warn!(?action, error = %e, "non-vital action failed; continuing");
                }
                Err(e) => {
                    self.roll_back(boundary, &executed, Some(action));
                    if e.is_user_exit() || boundary.vital {
                        return Err(e);
                    }
                    warn!(
                        boundary = boundary.id.as_deref().unwrap_or("<implicit>"),
                        error = %e,
                        "non-vital boundary rolled back; continuing"
                    );
                    return Ok(restart);
                }
            }
        }
        Ok(restart)
    }

    fn is_vital(&self, action: &ExecuteAction) -> bool {
        match action {
            ExecuteAction::Package { package_id, .. } => {
                self.manifest.package(package_id).is_none_or(|p| p.vital)
            }
            ExecuteAction::RelatedBundle { .. } => false,
            ExecuteAction::Update => true,
        }
    }

    fn execute_action(&self, action: &ExecuteAction, sync: &CacheSync) -> Result<Restart> {
        match action {
            ExecuteAction::Package {
                package_id, action, ..
            } => self.execute_package(package_id, *action, sync),
            ExecuteAction::RelatedBundle {
                bundle_id,
                action,
                relation,
                per_machine,
            } => self.execute_related(bundle_id, *action, *relation, *per_machine),
            ExecuteAction::Update => self.launch_update(sync),
        }
    }

    fn wait_for_cache(&self, sync: &CacheSync, key: &str) -> Result<()> {
        if let Err(e) = sync.wait(key) {
            self.notifier.check_canceled()?;
            return Err(e);
        }
        Ok(())
    }

    fn execute_package(&self, package_id: &str, action: ActionState, sync: &CacheSync) -> Result<Restart> {
        self.wait_for_cache(sync, package_id)?;
        let package = self
            .manifest
            .package(package_id)
            .ok_or_else(|| precondition(format!("unknown package '{package_id}'")))?;
        let mut events = ObserverEvents::new(self.notifier);

        loop {
            self.notifier.notify(&Event::ExecutePackageBegin {
                package_id,
                action,
                rollback: false,
            })?;
            info!(package = package_id, %action, "executing package");

            let result = self
                .router
                .call(
                    package.per_machine,
                    Request::ExecutePackage {
                        package_id: package_id.to_string(),
                        action,
                        rollback: false,
                        variables: self.variables.clone(),
                    },
                    &mut events,
                )
                .and_then(expect_restart);

            let e = match result {
                Ok(restart) => {
                    self.notifier.inform(&Event::ExecutePackageComplete {
                        package_id,
                        succeeded: true,
                        restart,
                    });
                    self.record_executed(package_id, action);
                    self.retries().clear(package_id);
                    return Ok(restart);
                }
                Err(e) => e,
            };

            let can_retry = {
                let mut retries = self.retries();
                retries.record_failure(package_id, &e);
                retries.can_retry(package_id)
            };
            let reply = self.notifier.notify(&Event::ExecutePackageComplete {
                package_id,
                succeeded: false,
                restart: Restart::None,
            })?;
            if e.is_user_exit() {
                return Err(e);
            }
            match reply {
                Reply::Retry if can_retry => {
                    warn!(package = package_id, error = %e, "package failed, retrying");
                }
                Reply::Ignore => {
                    warn!(package = package_id, error = %e, "package failure ignored");
                    self.record_executed(package_id, action);
                    return Ok(Restart::None);
                }
                _ => return Err(e),
            }
        }
    }

    fn execute_related(
        &self,
        bundle_id: &str,
        action: ActionState,
        relation: RelationType,
        per_machine: bool,
    ) -> Result<Restart> {
        self.notifier.notify(&Event::ExecutePackageBegin {
            package_id: bundle_id,
            action,
            rollback: false,
        })?;
        info!(bundle = bundle_id, %action, %relation, "executing related bundle");

        let result = self
            .router
            .call_quiet(
                per_machine,
                Request::ExecuteRelatedBundle {
                    bundle_id: bundle_id.to_string(),
                    action,
                    relation,
                },
            )
            .and_then(expect_restart);
        self.notifier.inform(&Event::ExecutePackageComplete {
            package_id: bundle_id,
            succeeded: result.is_ok(),
            restart: result.as_ref().map_or(Restart::None, |r| *r),
        });
        result
    }

    /// Hand over to the acquired update bundle
    fn launch_update(&self, sync: &CacheSync) -> Result<Restart> {
        self.wait_for_cache(sync, UPDATE_KEY)?;
        let path = self
            .update_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| precondition("the update bundle was not acquired"))?;

        self.notifier.notify(&Event::ExecutePackageBegin {
            package_id: UPDATE_KEY,
            action: ActionState::Install,
            rollback: false,
        })?;
        let result = run_bootstrapper(
            UPDATE_KEY,
            &path,
            &child_arguments(BundleAction::Install, RelationType::Update, &[]),
            &RestartExitCodes::default(),
        );
        self.notifier.inform(&Event::ExecutePackageComplete {
            package_id: UPDATE_KEY,
            succeeded: result.is_ok(),
            restart: result.as_ref().map_or(Restart::None, |r| *r),
        });
        result
    }

    fn roll_back(&self, boundary: &BoundaryPlan, executed: &[&ExecuteAction], failed: Option<&ExecuteAction>) {
        if self.disable_rollback {
            warn!("rollback is disabled; executed packages are left in place");
            return;
        }

        info!(
            boundary = boundary.id.as_deref().unwrap_or("<implicit>"),
            executed = executed.len(),
            "rolling back"
        );
        self.notifier.begin_rollback();
        for action in failed.into_iter().chain(executed.iter().rev().copied()) {
            if let ExecuteAction::Package {
                package_id,
                rollback,
                ..
            } = action
            {
                self.rollback_package(package_id, *rollback);
            }
        }
        self.notifier.end_rollback();
    }

    fn rollback_package(&self, package_id: &str, rollback: ActionState) {
        if rollback == ActionState::None {
            debug!(package = package_id, "nothing to roll back");
            return;
        }
        let Some(package) = self.manifest.package(package_id) else {
            return;
        };

        self.notifier.inform(&Event::ExecutePackageBegin {
            package_id,
            action: rollback,
            rollback: true,
        });
        let mut events = ObserverEvents::new(self.notifier);
        let result = self
            .router
            .call(
                package.per_machine,
                Request::ExecutePackage {
                    package_id: package_id.to_string(),
                    action: rollback,
                    rollback: true,
                    variables: self.variables.clone(),
                },
                &mut events,
            )
            .and_then(expect_restart);

        match &result {
            Ok(_) => {
                info!(package = package_id, action = %rollback, "package rolled back");
                self.record_executed(package_id, rollback);
            }
            Err(e) => warn!(package = package_id, error = %e, "rollback failed"),
        }
        self.notifier.inform(&Event::ExecutePackageComplete {
            package_id,
            succeeded: result.is_ok(),
            restart: result.unwrap_or_default(),
        });
    }
}
