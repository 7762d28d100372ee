//! Detection: searches, related bundles, available update and package state

use tracing::{debug, info, warn};

use super::Engine;
use super::notifier::Notifier;
use super::related;
use super::search::run_searches;
use crate::domain::PackageState;
use crate::engine::registration::RegistrationStore;
use crate::error::{BootstrapError, Result, engine::precondition};
use crate::events::{Event, Observer};
use crate::packages::{PackageContext, evaluate_condition};
use crate::variables::BUNDLE_INSTALLED;

impl Engine {
    /// Detect the current state of the machine.
    ///
    /// Every package is detected even when one fails; the first failure is
    /// returned once all have been tried.
    pub fn detect(&mut self, observer: &mut dyn Observer) -> Result<()> {
        self.detected = false;
        self.applied = false;
        self.plan = None;

        let notifier = Notifier::new(observer);
        let result = notifier
            .notify(&Event::DetectBegin {
                packages: self.manifest.packages.len(),
            })
            .and_then(|_| self.detect_all(&notifier));
        notifier.inform(&Event::DetectComplete {
            succeeded: result.is_ok(),
        });

        result?;
        self.detected = true;
        info!(
            installed = self.installed,
            related = self.related.len(),
            update = self.update.is_some(),
            "detect complete"
        );
        Ok(())
    }

    fn detect_all(&mut self, notifier: &Notifier<'_>) -> Result<()> {
        for package in &mut self.manifest.packages {
            package.reset_detect();
            package.reset_plan();
        }
        self.related.clear();
        self.update = None;

        let bundle = &self.manifest.bundle;
        self.installed = RegistrationStore::for_scope(self.cache.roots(), bundle.per_machine)
            .read(&bundle.id)?
            .is_some();
        self.variables.set_bool(BUNDLE_INSTALLED, self.installed);

        run_searches(&self.manifest.searches, &mut self.variables)?;

        self.related = related::detect_related(self.cache.roots(), &self.manifest.bundle)?;
        for bundle in &self.related {
            notifier.inform(&Event::DetectRelatedBundle {
                bundle_id: &bundle.record.id,
                relation: bundle.relation,
                version: &bundle.version,
            });
        }

        self.detect_update(notifier)?;

        let mut first_error: Option<BootstrapError> = None;
        for index in 0..self.manifest.packages.len() {
            notifier.check_canceled()?;
            let package_id = self.manifest.packages[index].id.clone();
            notifier.notify(&Event::DetectPackageBegin {
                package_id: &package_id,
            })?;

            let result = self.detect_package(index);
            let package = &mut self.manifest.packages[index];
            let succeeded = match result {
                Ok((state, cached)) => {
                    package.current_state = state;
                    package.cached = cached;
                    debug!(package = %package.id, ?state, cached, "package detected");
                    true
                }
                Err(e) if e.is_user_exit() => return Err(e),
                Err(e) => {
                    warn!(package = %package.id, error = %e, "package detection failed");
                    package.current_state = PackageState::Unknown;
                    first_error.get_or_insert(e);
                    false
                }
            };
            notifier.inform(&Event::DetectPackageComplete {
                package_id: &package.id,
                state: package.current_state,
                cached: package.cached,
                succeeded,
            });
        }

        first_error.map_or(Ok(()), Err)
    }

    fn detect_update(&mut self, notifier: &Notifier<'_>) -> Result<()> {
        let Some(update) = &self.manifest.update else {
            return Ok(());
        };
        let ours = self.manifest.bundle.parsed_version()?;
        let theirs = semver::Version::parse(&update.version)
            .map_err(|e| precondition(format!("update version '{}': {e}", update.version)))?;
        if theirs <= ours {
            debug!(%ours, %theirs, "update is not newer");
            return Ok(());
        }

        notifier.inform(&Event::DetectUpdate {
            location: &update.location,
            version: &update.version,
        });
        info!(location = %update.location, version = %update.version, "update available");
        self.update = Some(update.clone());
        Ok(())
    }

    /// Current state and cache completeness of one package
    fn detect_package(&self, index: usize) -> Result<(PackageState, bool)> {
        let package = &self.manifest.packages[index];

        let mut cached = true;
        for payload in self.manifest.package_payloads(package) {
            let path = self
                .cache
                .completed_path(package.per_machine, &package.cache_id)
                .path
                .join(&payload.file_path);
            if !path.is_file() {
                cached = false;
                continue;
            }
            if package.per_machine {
                // Corrupt per-machine payloads are replaced by the companion during apply.
                cached &= self
                    .cache
                    .is_payload_cached(package.per_machine, &package.cache_id, payload);
                continue;
            }
            match self
                .cache
                .verify_payload(package.per_machine, &package.cache_id, payload)
            {
                Ok(_) => {}
                Err(e) if e.is_verification_failure() => {
                    warn!(package = %package.id, payload = %payload.key, error = %e, "removed corrupt cached payload");
                    cached = false;
                }
                Err(e) => return Err(e),
            }
        }

        let context = PackageContext {
            manifest: &self.manifest,
            cache: &self.cache,
            variables: &self.variables,
        };
        let state = match self.engines.get(package) {
            Ok(engine) => engine.detect(package, &context)?,
            Err(_) => package
                .detect
                .as_ref()
                .map_or(PackageState::Unknown, |c| evaluate_condition(c, &self.variables)),
        };
        Ok((state, cached))
    }
}
