//! Cache phase: acquire, verify and promote everything the plan needs
//!
//! Runs on its own thread. Each finished item is published to [`CacheSync`]
//! so the execute phase can start a package as soon as its payloads are in
//! place when caching runs in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, PoisonError};

use tracing::{debug, info, warn};

use super::apply::ApplyRun;
use super::plan::{CacheAction, UPDATE_KEY};
use super::router::{ObserverEvents, expect_path};
use crate::cache::TransferMode;
use crate::cache::verify::{Expectation, verify_or_delete};
use crate::config::manifest::MANIFEST_FILE;
use crate::domain::{Payload, Verification};
use crate::elevation::Request;
use crate::error::{
    BootstrapError, Result,
    cache::operation_failed,
    engine::precondition,
    fs::write_failed,
};
use crate::events::{Event, Reply};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Pending,
    Cached,
    Failed,
}

/// Completion of cache actions, shared with the execute phase
#[derive(Debug, Default)]
pub struct CacheSync {
    slots: Mutex<HashMap<String, Slot>>,
    changed: Condvar,
}

impl CacheSync {
    pub fn new<'k>(keys: impl IntoIterator<Item = &'k str>) -> Self {
        Self {
            slots: Mutex::new(keys.into_iter().map(|k| (k.to_string(), Slot::Pending)).collect()),
            changed: Condvar::new(),
        }
    }

    pub fn complete(&self, key: &str, cached: bool) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.to_string(), if cached { Slot::Cached } else { Slot::Failed });
        self.changed.notify_all();
    }

    /// Fail every item still pending; called when the cache phase ends
    pub fn abandon(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values_mut() {
            if *slot == Slot::Pending {
                *slot = Slot::Failed;
            }
        }
        self.changed.notify_all();
    }

    /// Block until `key` is cached. Keys the plan never cached are ready.
    pub fn wait(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match slots.get(key).copied() {
                None | Some(Slot::Cached) => return Ok(()),
                Some(Slot::Failed) => {
                    return Err(operation_failed(format!("'{key}' was not cached")));
                }
                Some(Slot::Pending) => {
                    slots = self
                        .changed
                        .wait(slots)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }
}

/// Abandons pending items when the cache thread exits, even by panic
struct AbandonOnDrop<'s>(&'s CacheSync);

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.0.abandon();
    }
}

/// What the cache thread hands back
#[derive(Debug, Default)]
pub struct CacheOutcome {
    pub result: Option<Result<()>>,
    /// Completed package directories this apply created
    pub created: Vec<(bool, String)>,
    pub last_used_source: Option<PathBuf>,
}

impl CacheOutcome {
    pub fn failed(&self) -> bool {
        matches!(self.result, Some(Err(_)))
    }
}

impl ApplyRun<'_, '_> {
    pub(super) fn run_cache_phase(&self, sync: &CacheSync) -> CacheOutcome {
        let _abandon = AbandonOnDrop(sync);
        let mut outcome = CacheOutcome::default();
        let result = self.cache_all(sync, &mut outcome);
        self.notifier.inform(&Event::CacheComplete {
            succeeded: result.is_ok(),
        });
        outcome.result = Some(result);
        outcome
    }

    fn cache_all(&self, sync: &CacheSync, outcome: &mut CacheOutcome) -> Result<()> {
        self.notifier.notify(&Event::CacheBegin {
            packages: self.plan.cache_package_count(),
        })?;

        let mut extracted = HashMap::new();
        for action in &self.plan.cache_actions {
            self.notifier.check_canceled()?;
            if self.caching_stopped() {
                debug!("execution failed; remaining cache actions skipped");
                break;
            }
            let result = match action {
                CacheAction::Package { package_id } => {
                    self.cache_package_with_retry(package_id, &mut extracted, outcome)
                }
                CacheAction::Layout { directory } => self.layout(directory, outcome),
                CacheAction::Update => self.acquire_update(),
            };
            sync.complete(action.key(), result.is_ok());
            result?;
        }
        Ok(())
    }

    fn cache_package_with_retry(
        &self,
        package_id: &str,
        extracted: &mut HashMap<String, PathBuf>,
        outcome: &mut CacheOutcome,
    ) -> Result<()> {
        let package = self
            .manifest
            .package(package_id)
            .ok_or_else(|| precondition(format!("unknown package '{package_id}'")))?;
        let completed = self.cache.completed_path(package.per_machine, &package.cache_id).path;
        let existed = completed.is_dir();

        let result = self.retry_cache_package(package_id, extracted, outcome);
        if !existed && completed.is_dir() {
            outcome.created.push((package.per_machine, package.cache_id.clone()));
        }
        result
    }

    fn retry_cache_package(
        &self,
        package_id: &str,
        extracted: &mut HashMap<String, PathBuf>,
        outcome: &mut CacheOutcome,
    ) -> Result<()> {
        loop {
            match self.cache_package(package_id, extracted, outcome) {
                Ok(()) => {
                    self.notifier.inform(&Event::CachePackageComplete {
                        package_id,
                        succeeded: true,
                    });
                    return Ok(());
                }
                Err(e) if e.is_user_exit() => {
                    self.notifier.inform(&Event::CachePackageComplete {
                        package_id,
                        succeeded: false,
                    });
                    return Err(e);
                }
                Err(e) => {
                    let can_retry = {
                        let mut retries = self.retries();
                        retries.record_failure(package_id, &e);
                        retries.can_retry(package_id)
                    };
                    let reply = self.notifier.notify(&Event::CachePackageComplete {
                        package_id,
                        succeeded: false,
                    })?;
                    let retry = match reply {
                        Reply::Retry => can_retry,
                        Reply::Continue => can_retry && e.is_verification_failure(),
                        _ => false,
                    };
                    if !retry {
                        warn!(package = package_id, error = %e, "failed to cache package");
                        return Err(e);
                    }
                    warn!(package = package_id, error = %e, "caching failed, acquiring again");
                }
            }
        }
    }

    fn cache_package(
        &self,
        package_id: &str,
        extracted: &mut HashMap<String, PathBuf>,
        outcome: &mut CacheOutcome,
    ) -> Result<()> {
        let package = self
            .manifest
            .package(package_id)
            .ok_or_else(|| precondition(format!("unknown package '{package_id}'")))?;
        let payloads: Vec<&Payload> = self.manifest.package_payloads(package).collect();
        self.notifier.notify(&Event::CachePackageBegin {
            package_id,
            payloads: payloads.len(),
        })?;

        let mut events = ObserverEvents::new(self.notifier);
        for payload in payloads {
            self.notifier.check_canceled()?;
            if self
                .cache
                .is_payload_cached(package.per_machine, &package.cache_id, payload)
            {
                debug!(package = package_id, payload = %payload.key, "payload already cached");
                continue;
            }

            let working_path = match &payload.container {
                None => {
                    let acquired = self.cache.acquire_payload(payload, None, &mut events)?;
                    if let Some(folder) = acquired.source_folder {
                        outcome.last_used_source = Some(folder);
                    }
                    acquired.path
                }
                Some(container_id) => match extracted.get(&payload.key) {
                    Some(path) if path.is_file() => path.clone(),
                    _ => {
                        self.extract_container(container_id, extracted, outcome, &mut events)?;
                        extracted.get(&payload.key).cloned().ok_or_else(|| {
                            operation_failed(format!(
                                "payload '{}' missing from container '{container_id}'",
                                payload.key
                            ))
                        })?
                    }
                },
            };

            let response = self.router.call(
                package.per_machine,
                Request::CacheCompletePayload {
                    package_id: package_id.to_string(),
                    payload_key: payload.key.clone(),
                    working_path,
                    move_file: true,
                },
                &mut events,
            )?;
            let path = expect_path(response)?;
            debug!(package = package_id, path = %path.display(), "payload in place");
        }

        info!(package = package_id, "package cached");
        Ok(())
    }

    fn extract_container(
        &self,
        container_id: &str,
        extracted: &mut HashMap<String, PathBuf>,
        outcome: &mut CacheOutcome,
        events: &mut ObserverEvents<'_, '_>,
    ) -> Result<()> {
        let container = self
            .manifest
            .container(container_id)
            .ok_or_else(|| precondition(format!("unknown container '{container_id}'")))?;
        let acquired = self.cache.acquire_container(container, None, &mut *events)?;
        if let Some(folder) = acquired.source_folder.clone() {
            outcome.last_used_source = Some(folder);
        }

        let payloads: Vec<&Payload> = self
            .manifest
            .payloads
            .iter()
            .filter(|p| p.container.as_deref() == Some(container_id))
            .collect();
        for (key, path) in self
            .cache
            .extract_container(container, &acquired.path, &payloads, &mut *events)?
        {
            extracted.insert(key, path);
        }
        Ok(())
    }

    fn layout(&self, directory: &Path, outcome: &mut CacheOutcome) -> Result<()> {
        std::fs::create_dir_all(directory).map_err(|e| write_failed(directory, &e))?;
        let mut events = ObserverEvents::new(self.notifier);

        for (source, name) in [
            (self.engine_path, self.manifest.bundle.executable_name.as_str()),
            (self.manifest_path, MANIFEST_FILE),
        ] {
            let destination = directory.join(name);
            if dunce::canonicalize(source).ok() == dunce::canonicalize(&destination).ok() && destination.is_file() {
                continue;
            }
            crate::cache::transfer::transfer_file(
                source,
                &destination,
                TransferMode::Copy,
                self.cache.retry(),
                &mut |_| Ok(()),
            )?;
        }

        for container in &self.manifest.containers {
            self.notifier.check_canceled()?;
            let acquired = self
                .cache
                .acquire_container(container, Some(directory), &mut events)?;
            if let Some(folder) = acquired.source_folder {
                outcome.last_used_source = Some(folder);
            }
            self.cache.layout_container(
                directory,
                container,
                &acquired.path,
                TransferMode::Move,
                &mut events,
            )?;
        }

        for payload in self.manifest.payloads.iter().filter(|p| !p.is_embedded()) {
            self.notifier.check_canceled()?;
            let acquired = self
                .cache
                .acquire_payload(payload, Some(directory), &mut events)?;
            if let Some(folder) = acquired.source_folder {
                outcome.last_used_source = Some(folder);
            }
            self.cache.layout_payload(
                directory,
                payload,
                &acquired.path,
                TransferMode::Move,
                &mut events,
            )?;
        }

        info!(directory = %directory.display(), "layout complete");
        Ok(())
    }

    /// Acquire and leniently verify the update bundle into the working folder
    fn acquire_update(&self) -> Result<()> {
        let update = self
            .update
            .ok_or_else(|| precondition("no newer bundle is available to update to"))?;
        let is_url = update.location.contains("://");
        let file_name = update
            .location
            .rsplit(['/', '\\'])
            .find(|s| !s.is_empty())
            .unwrap_or(UPDATE_KEY)
            .to_string();

        let payload = Payload {
            key: UPDATE_KEY.to_string(),
            file_path: file_name,
            size: update.size,
            verification: Verification::UpdateBundle {
                hash: update.hash.clone(),
            },
            source_path: (!is_url).then(|| update.location.clone()),
            container: None,
            download_url: is_url.then(|| update.location.clone()),
        };

        let mut events = ObserverEvents::new(self.notifier);
        let acquired = self.cache.acquire_payload(&payload, None, &mut events)?;
        verify_or_delete(
            &acquired.path,
            &Expectation::for_payload(&payload),
            self.cache.trust(),
            self.cache.retry(),
        )?;
        make_executable(&acquired.path)?;

        info!(path = %acquired.path.display(), version = %update.version, "update acquired");
        *self
            .update_path
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(acquired.path);
        Ok(())
    }
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).map_err(|e| write_failed(path, &e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

impl From<std::thread::Result<CacheOutcome>> for CacheOutcome {
    fn from(joined: std::thread::Result<CacheOutcome>) -> Self {
        joined.unwrap_or_else(|_| CacheOutcome {
            result: Some(Err(BootstrapError::CacheOperationFailed {
                message: "cache thread panicked".to_string(),
            })),
            ..CacheOutcome::default()
        })
    }
}
