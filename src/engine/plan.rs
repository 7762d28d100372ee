//! Planning: turn detected state and requested action into an ordered plan

use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::Engine;
use super::notifier::Notifier;
use super::related;
use crate::config::BundleAction;
use crate::domain::{ActionState, RelationType, RequestState};
use crate::error::{Result, engine::precondition};
use crate::events::{Event, Reply};

/// Something the cache phase acquires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheAction {
    /// Acquire, verify and promote every payload of a package
    Package { package_id: String },
    /// Copy the bundle, its containers and loose payloads into `directory`
    Layout { directory: PathBuf },
    /// Acquire the newer bundle that replaces this one
    Update,
}

impl CacheAction {
    /// Key the execute phase waits on
    pub fn key(&self) -> &str {
        match self {
            CacheAction::Package { package_id } => package_id,
            CacheAction::Layout { .. } => "layout",
            CacheAction::Update => UPDATE_KEY,
        }
    }
}

pub(crate) const UPDATE_KEY: &str = "bundle-update";

/// Something the execute phase runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecuteAction {
    Package {
        package_id: String,
        action: ActionState,
        rollback: ActionState,
    },
    RelatedBundle {
        bundle_id: String,
        action: ActionState,
        relation: RelationType,
        per_machine: bool,
    },
    /// Run the acquired update bundle
    Update,
}

/// Packages that commit or roll back together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryPlan {
    /// Authored boundary id; `None` for an implicit group
    pub id: Option<String>,
    pub vital: bool,
    pub transaction: bool,
    pub actions: Vec<ExecuteAction>,
}

impl BoundaryPlan {
    fn implicit() -> Self {
        Self {
            id: None,
            vital: true,
            transaction: false,
            actions: Vec::new(),
        }
    }
}

/// Remove a package's payloads once apply succeeds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanAction {
    pub package_id: String,
}

/// Ordered actions for one apply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub action: BundleAction,
    /// Whether any work needs the elevated companion
    pub per_machine: bool,
    /// Register the bundle before caching
    pub register: bool,
    /// Unregister the bundle once execution succeeds
    pub unregister: bool,
    /// A newer version of this bundle is installed; packages are left alone
    pub downgrade: bool,
    pub cache_actions: Vec<CacheAction>,
    pub boundaries: Vec<BoundaryPlan>,
    pub clean_actions: Vec<CleanAction>,
}

impl Plan {
    pub fn execute_actions(&self) -> impl Iterator<Item = &ExecuteAction> {
        self.boundaries.iter().flat_map(|b| b.actions.iter())
    }

    pub fn execute_action_count(&self) -> usize {
        self.execute_actions().count()
    }

    pub fn cache_package_count(&self) -> usize {
        self.cache_actions
            .iter()
            .filter(|a| matches!(a, CacheAction::Package { .. }))
            .count()
    }

    /// Whether the plan does nothing at all
    pub fn is_empty(&self) -> bool {
        !self.register
            && !self.unregister
            && self.cache_actions.is_empty()
            && self.boundaries.is_empty()
            && self.clean_actions.is_empty()
    }
}

impl Engine {
    /// Build the plan for the command's action. Requires a successful detect
    /// that has not been followed by an apply.
    pub fn plan(&mut self, observer: &mut dyn crate::events::Observer) -> Result<&Plan> {
        if !self.detected {
            return Err(precondition("plan requires a successful detect"));
        }
        if self.applied {
            return Err(precondition("machine state changed; detect again before planning"));
        }
        self.plan = None;

        let notifier = Notifier::new(observer);
        let result = notifier
            .notify(&Event::PlanBegin {
                packages: self.manifest.packages.len(),
            })
            .and_then(|_| match self.command.action {
                BundleAction::Layout => self.plan_layout(),
                BundleAction::UpdateReplace => self.plan_update(),
                _ => self.plan_packages(&notifier),
            });
        notifier.inform(&Event::PlanComplete {
            succeeded: result.is_ok(),
        });

        let plan = result?;
        info!(
            action = %plan.action,
            cache = plan.cache_actions.len(),
            execute = plan.execute_action_count(),
            clean = plan.clean_actions.len(),
            per_machine = plan.per_machine,
            "plan ready"
        );
        Ok(self.plan.insert(plan))
    }

    fn plan_layout(&self) -> Result<Plan> {
        let directory = self
            .command
            .layout_directory
            .clone()
            .ok_or_else(|| precondition("layout requires a layout directory"))?;
        Ok(Plan {
            action: BundleAction::Layout,
            cache_actions: vec![CacheAction::Layout { directory }],
            ..Plan::default()
        })
    }

    fn plan_update(&self) -> Result<Plan> {
        if self.update.is_none() {
            return Err(precondition("no newer bundle is available to update to"));
        }
        Ok(Plan {
            action: BundleAction::UpdateReplace,
            cache_actions: vec![CacheAction::Update],
            boundaries: vec![BoundaryPlan {
                actions: vec![ExecuteAction::Update],
                ..BoundaryPlan::implicit()
            }],
            ..Plan::default()
        })
    }

    fn plan_packages(&mut self, notifier: &Notifier<'_>) -> Result<Plan> {
        let action = self.command.action;
        let version = self.manifest.bundle.parsed_version()?;
        let downgrade = action != BundleAction::Uninstall && related::is_downgrade(&version, &self.related);
        if downgrade {
            warn!(version = %version, "a newer version of this bundle is installed; packages are left unchanged");
        }

        for package in &mut self.manifest.packages {
            notifier.check_canceled()?;
            package.reset_plan();

            let recommended = if downgrade {
                RequestState::None
            } else {
                package.default_request(action)
            };
            let reply = notifier.notify(&Event::PlanPackageBegin {
                package_id: &package.id,
                recommended,
            })?;
            package.requested = match reply {
                Reply::Request(requested) => requested,
                _ => recommended,
            };

            match self.engines.get(package) {
                Ok(engine) => engine.plan(package)?,
                Err(e) => {
                    package.calculate_actions();
                    if package.execute != ActionState::None {
                        return Err(e);
                    }
                }
            }
            debug!(
                package = %package.id,
                requested = ?package.requested,
                execute = %package.execute,
                rollback = %package.rollback,
                cache = package.cache_requested,
                uncache = package.uncache_after_apply,
                "package planned"
            );
            notifier.inform(&Event::PlanPackageComplete {
                package_id: &package.id,
                requested: package.requested,
                execute: package.execute,
                rollback: package.rollback,
            });
        }

        related::plan_related(
            action,
            self.command.relation_type,
            &version,
            downgrade,
            &mut self.related,
        );
        for bundle in &self.related {
            notifier.inform(&Event::PlanRelatedBundle {
                bundle_id: &bundle.record.id,
                relation: bundle.relation,
                action: bundle.execute,
            });
        }

        let mut plan = Plan {
            action,
            downgrade,
            register: !downgrade
                && matches!(
                    action,
                    BundleAction::Install | BundleAction::Modify | BundleAction::Repair | BundleAction::Cache
                ),
            unregister: action == BundleAction::Uninstall,
            ..Plan::default()
        };

        let mut boundaries = vec![BoundaryPlan::implicit()];
        for package in &self.manifest.packages {
            if let Some(id) = &package.rollback_boundary {
                let authored = self
                    .manifest
                    .boundary(id)
                    .ok_or_else(|| precondition(format!("unknown rollback boundary '{id}'")))?;
                boundaries.push(BoundaryPlan {
                    id: Some(authored.id.clone()),
                    vital: authored.vital,
                    transaction: authored.transaction,
                    actions: Vec::new(),
                });
            }

            if package.cache_requested {
                plan.cache_actions.push(CacheAction::Package {
                    package_id: package.id.clone(),
                });
            }
            if package.uncache_after_apply {
                plan.clean_actions.push(CleanAction {
                    package_id: package.id.clone(),
                });
            }
            if package.execute != ActionState::None {
                if let Some(boundary) = boundaries.last_mut() {
                    boundary.actions.push(ExecuteAction::Package {
                        package_id: package.id.clone(),
                        action: package.execute,
                        rollback: package.rollback,
                    });
                }
            }
            if package.per_machine
                && (package.cache_requested || package.uncache_after_apply || package.execute != ActionState::None)
            {
                plan.per_machine = true;
            }
        }

        if action == BundleAction::Uninstall {
            boundaries.reverse();
            for boundary in &mut boundaries {
                boundary.actions.reverse();
            }
        }

        let related_actions: Vec<ExecuteAction> = self
            .related
            .iter()
            .filter(|r| r.execute != ActionState::None)
            .map(|r| {
                if r.record.per_machine {
                    plan.per_machine = true;
                }
                ExecuteAction::RelatedBundle {
                    bundle_id: r.record.id.clone(),
                    action: r.execute,
                    relation: r.relation,
                    per_machine: r.record.per_machine,
                }
            })
            .collect();
        if !related_actions.is_empty() {
            let group = BoundaryPlan {
                actions: related_actions,
                ..BoundaryPlan::implicit()
            };
            if action == BundleAction::Uninstall {
                boundaries.insert(0, group);
            } else {
                boundaries.push(group);
            }
        }

        boundaries.retain(|b| !b.actions.is_empty());
        plan.boundaries = boundaries;

        if self.manifest.bundle.per_machine && (plan.register || plan.unregister) {
            plan.per_machine = true;
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests;
