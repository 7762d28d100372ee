//! Related bundle detection and planning

use tracing::{debug, warn};

use crate::cache::CacheRoots;
use crate::config::BundleAction;
use crate::domain::{ActionState, RegistrationInfo, RelatedBundle, RelationType, RequestState};
use crate::engine::registration::RegistrationStore;
use crate::error::Result;

/// Scan both registration scopes for bundles related to `ours`.
///
/// Add-ons and patches come first so they are handled ahead of their parent.
pub fn detect_related(roots: &CacheRoots, ours: &RegistrationInfo) -> Result<Vec<RelatedBundle>> {
    let mut related = Vec::new();
    for per_machine in [true, false] {
        for record in RegistrationStore::for_scope(roots, per_machine).list()? {
            let relation = RelatedBundle::relation_of(ours, &record);
            if relation == RelationType::None {
                continue;
            }
            let version = match semver::Version::parse(&record.version) {
                Ok(version) => version,
                Err(e) => {
                    warn!(bundle = %record.id, version = %record.version, error = %e, "skipping related bundle with invalid version");
                    continue;
                }
            };
            debug!(bundle = %record.id, %relation, %version, per_machine, "related bundle");
            related.push(RelatedBundle::new(record, relation, version));
        }
    }

    related.sort_by(|a, b| {
        b.relation
            .is_dependent_child()
            .cmp(&a.relation.is_dependent_child())
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
    Ok(related)
}

/// Whether a newer version of this bundle is already installed
pub fn is_downgrade(ours: &semver::Version, related: &[RelatedBundle]) -> bool {
    related
        .iter()
        .any(|r| r.relation == RelationType::Upgrade && r.version > *ours)
}

/// Decide what happens to each related bundle when this bundle runs `action`.
///
/// `launched_as` is the relation this bundle itself was started with; an
/// upgrade removing us must leave our add-ons for the new parent.
pub fn plan_related(
    action: BundleAction,
    launched_as: RelationType,
    ours: &semver::Version,
    downgrade: bool,
    related: &mut [RelatedBundle],
) {
    for bundle in related.iter_mut() {
        let (requested, execute) = match (action, bundle.relation) {
            (BundleAction::Uninstall, RelationType::Addon | RelationType::Patch)
                if launched_as != RelationType::Upgrade =>
            {
                (RequestState::Absent, ActionState::Uninstall)
            }
            (
                BundleAction::Install | BundleAction::UpdateReplace,
                RelationType::Upgrade,
            ) if !downgrade && bundle.version < *ours => (RequestState::Absent, ActionState::Uninstall),
            (
                BundleAction::Repair | BundleAction::Modify,
                RelationType::Addon | RelationType::Patch,
            ) => (RequestState::Repair, ActionState::Repair),
            _ => (RequestState::None, ActionState::None),
        };
        bundle.requested = requested;
        bundle.execute = execute;
        bundle.rollback = ActionState::None;
    }
}
