//! Executes privileged requests
//!
//! The same handler serves requests in-process (per-user work, or when the
//! primary already runs with the needed privileges) and inside the elevated
//! companion.

use std::process::{Command, Stdio};

use tracing::{debug, info};

use super::protocol::{Request, Response};
use crate::cache::{Cache, CacheMessage, CacheReply, TransferMode};
use crate::config::Manifest;
use crate::domain::{Package, Payload};
use crate::engine::registration::{self, RegistrationStore};
use crate::error::{
    BootstrapError, Result,
    engine::{package_failed, precondition},
};
use crate::packages::{PackageContext, PackageEngines, bundle::run_related_bundle};

/// Notifications raised while a request runs; `Cancel` stops it
pub trait RequestEvents {
    fn cache_message(&mut self, id: &str, message: CacheMessage) -> CacheReply;
    fn execute_progress(&mut self, package_id: &str, percent: u8) -> CacheReply;
}

/// Events sink that never cancels
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEvents;

impl RequestEvents for NoEvents {
    fn cache_message(&mut self, _id: &str, _message: CacheMessage) -> CacheReply {
        CacheReply::Continue
    }

    fn execute_progress(&mut self, _package_id: &str, _percent: u8) -> CacheReply {
        CacheReply::Continue
    }
}

#[derive(Clone, Copy)]
pub struct RequestHandler<'a> {
    manifest: &'a Manifest,
    cache: &'a Cache,
    engines: &'a PackageEngines,
}

impl<'a> RequestHandler<'a> {
    pub fn new(manifest: &'a Manifest, cache: &'a Cache, engines: &'a PackageEngines) -> Self {
        Self {
            manifest,
            cache,
            engines,
        }
    }

    fn package(&self, id: &str) -> Result<&'a Package> {
        self.manifest
            .package(id)
            .ok_or_else(|| precondition(format!("unknown package '{id}'")))
    }

    fn payload(&self, key: &str) -> Result<&'a Payload> {
        self.manifest
            .payload(key)
            .ok_or_else(|| precondition(format!("unknown payload '{key}'")))
    }

    pub fn handle(&self, request: Request, events: &mut dyn RequestEvents) -> Result<Response> {
        let bundle = &self.manifest.bundle;
        match request {
            Request::ApplyInitialize | Request::ApplyUninitialize | Request::Terminate => Ok(Response::Done),

            Request::SessionBegin {
                engine_path,
                manifest_path,
            } => {
                registration::register(self.cache, bundle, &engine_path, &manifest_path)?;
                info!(bundle = %bundle.id, per_machine = bundle.per_machine, "bundle registered");
                Ok(Response::Done)
            }

            Request::SessionEnd { unregister } => {
                if unregister {
                    registration::unregister(self.cache, bundle)?;
                    info!(bundle = %bundle.id, "bundle unregistered");
                }
                Ok(Response::Done)
            }

            Request::SaveState { variables } => {
                registration::save_state(self.cache, bundle, &variables)?;
                Ok(Response::Done)
            }

            Request::CacheCompletePayload {
                package_id,
                payload_key,
                working_path,
                move_file,
            } => {
                let package = self.package(&package_id)?;
                let payload = self.payload(&payload_key)?;
                let mode = if move_file {
                    TransferMode::Move
                } else {
                    TransferMode::Copy
                };
                let mut handler = |id: &str, message: CacheMessage| events.cache_message(id, message);
                let path = self.cache.complete_payload(
                    package.per_machine,
                    &package.cache_id,
                    payload,
                    &working_path,
                    mode,
                    &mut handler,
                )?;
                Ok(Response::Path { path })
            }

            Request::CacheVerifyPayload {
                package_id,
                payload_key,
            } => {
                let package = self.package(&package_id)?;
                let payload = self.payload(&payload_key)?;
                let path = self
                    .cache
                    .verify_payload(package.per_machine, &package.cache_id, payload)?;
                Ok(Response::Path { path })
            }

            Request::CacheRemovePackage { package_id } => {
                let package = self.package(&package_id)?;
                self.cache
                    .remove_package(package.per_machine, &package.cache_id)?;
                Ok(Response::Done)
            }

            Request::CacheCleanup { per_machine } => {
                self.cache.cleanup(per_machine)?;
                Ok(Response::Done)
            }

            Request::ExecutePackage {
                package_id,
                action,
                rollback,
                variables,
            } => {
                let package = self.package(&package_id)?;
                let engine = self.engines.get(package)?;
                let context = PackageContext {
                    manifest: self.manifest,
                    cache: self.cache,
                    variables: &variables,
                };

                let mut progress = |percent: u8| {
                    let reply = events.execute_progress(&package_id, percent);
                    if reply == CacheReply::Cancel && !rollback {
                        Err(BootstrapError::UserExit)
                    } else {
                        Ok(())
                    }
                };
                let restart = engine.execute(package, action, &context, &mut progress)?;
                Ok(Response::Restart { restart })
            }

            Request::ExecuteRelatedBundle {
                bundle_id,
                action,
                relation,
            } => {
                let roots = self.cache.roots();
                let record = match RegistrationStore::for_scope(roots, true).read(&bundle_id)? {
                    Some(record) => record,
                    None => RegistrationStore::for_scope(roots, false)
                        .read(&bundle_id)?
                        .ok_or_else(|| package_failed(&bundle_id, "related bundle is no longer registered"))?,
                };
                let restart = run_related_bundle(self.cache, &record, action, relation)?;
                Ok(Response::Restart { restart })
            }

            Request::LaunchApprovedExe { id, variables } => {
                let approved = self
                    .manifest
                    .approved_exe(&id)
                    .ok_or_else(|| precondition(format!("'{id}' is not an approved executable")))?;
                let path = variables.expand(&approved.path);
                let arguments: Vec<String> = approved
                    .arguments
                    .iter()
                    .map(|a| variables.expand(a))
                    .collect();

                debug!(id, path, ?arguments, "launching approved executable");
                let child = Command::new(&path)
                    .args(&arguments)
                    .stdin(Stdio::null())
                    .spawn()
                    .map_err(|e| package_failed(&id, format!("failed to launch {path}: {e}")))?;
                Ok(Response::Launched { pid: child.id() })
            }
        }
    }
}
