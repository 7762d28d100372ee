//! Cache operations
//!
//! Acquisition into the working folder, the acquire/verify/promote pipeline
//! for payloads and containers, layout, verify-in-place, eviction and cleanup.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};

use super::message::{CacheMessageHandler, CacheStep, Reporter};
use super::paths::{acquisition_path, is_resume_fragment};
use super::signature::{SIGNATURE_SUFFIX, envelope_path};
use super::sources::SourceRequest;
use super::transfer::{
    TransferMode, canceled, copy_with_progress, remove_dir_all_with_retry, remove_file_with_retry,
    transfer_file,
};
use super::verify::{Expectation, container_verification, verify_or_delete};
use super::{Cache, acl};
use crate::domain::{Container, Payload};
use crate::error::{
    Result,
    cache::{download_failed, operation_failed, source_not_found},
};

/// An artifact placed in the working folder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acquired {
    pub path: PathBuf,
    /// Folder the source was found in, when it came from a local folder
    pub source_folder: Option<PathBuf>,
    pub downloaded: bool,
}

/// Where an artifact comes from
#[derive(Debug, Clone, Copy)]
struct SourceSpec<'a> {
    key: &'a str,
    relative_path: &'a str,
    source_path: Option<&'a str>,
    download_url: Option<&'a str>,
    /// A detached signature envelope travels with the artifact
    signed: bool,
}

impl Cache {
    /// Whether `payload` is already in its completed location and verifies
    pub fn is_payload_cached(&self, per_machine: bool, cache_id: &str, payload: &Payload) -> bool {
        let path = self
            .completed_path(per_machine, cache_id)
            .path
            .join(&payload.file_path);
        path.is_file()
            && super::verify::verify_file(&path, &Expectation::for_payload(payload), self.trust())
                .is_ok()
    }

    /// Locate or download a container into the working folder
    pub fn acquire_container(
        &self,
        container: &Container,
        layout_directory: Option<&Path>,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<Acquired> {
        let spec = SourceSpec {
            key: &container.id,
            relative_path: &container.file_path,
            source_path: None,
            download_url: container.download_url.as_deref(),
            signed: false,
        };
        self.acquire(&spec, container.size, layout_directory, handler)
    }

    /// Locate or download a payload that is not shipped in a container
    pub fn acquire_payload(
        &self,
        payload: &Payload,
        layout_directory: Option<&Path>,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<Acquired> {
        let spec = SourceSpec {
            key: &payload.key,
            relative_path: &payload.file_path,
            source_path: payload.source_path.as_deref(),
            download_url: payload.download_url.as_deref(),
            signed: payload.verification.is_signed(),
        };
        self.acquire(&spec, payload.size, layout_directory, handler)
    }

    fn acquire(
        &self,
        spec: &SourceSpec<'_>,
        size: Option<u64>,
        layout_directory: Option<&Path>,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<Acquired> {
        let destination = acquisition_path(self.working_folder()?, spec.key);
        let candidates = self.local_source_paths(&SourceRequest {
            relative_path: spec.relative_path,
            source_path: spec.source_path,
            destination: Some(&destination),
            layout_directory,
        });

        let mut reporter = Reporter::new(spec.key, handler);
        let result = reporter.step(CacheStep::Acquire, |r| {
            if let Some((index, found)) = candidates.first_existing() {
                if Some(index) == candidates.destination {
                    debug!(key = spec.key, "already acquired");
                    let bytes = fs::metadata(&destination)?.len();
                    return Ok((
                        Acquired {
                            path: destination.clone(),
                            source_folder: None,
                            downloaded: false,
                        },
                        bytes,
                    ));
                }

                let bytes = transfer_file(
                    found,
                    &destination,
                    TransferMode::Copy,
                    &self.retry,
                    &mut |n| {
                        r.progress(CacheStep::Acquire, n, size)
                            .map_err(|_| canceled())
                    },
                )?;
                if spec.signed {
                    self.transfer_envelope(found, &destination, TransferMode::Copy)?;
                }
                info!(key = spec.key, source = %found.display(), "acquired from local source");
                let source_folder = source_folder_of(found, spec);
                return Ok((
                    Acquired {
                        path: destination.clone(),
                        source_folder,
                        downloaded: false,
                    },
                    bytes,
                ));
            }

            let Some(url) = spec.download_url else {
                return Err(source_not_found(spec.key, &candidates.paths));
            };

            let bytes = self.download(url, &destination, size, r)?;
            if spec.signed {
                self.download_envelope(url, &destination);
            }
            Ok((
                Acquired {
                    path: destination.clone(),
                    source_folder: None,
                    downloaded: true,
                },
                bytes,
            ))
        });
        reporter.complete(result)
    }

    fn download(
        &self,
        url: &str,
        destination: &Path,
        size: Option<u64>,
        reporter: &mut Reporter<'_>,
    ) -> Result<u64> {
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            return Err(download_failed(url, "only http and https downloads are supported"));
        }

        let mut fragment = destination.as_os_str().to_owned();
        fragment.push(".");
        fragment.push(super::paths::RESUME_FRAGMENT_EXTENSION);
        let fragment = PathBuf::from(fragment);

        info!(url, destination = %destination.display(), "downloading");
        let bytes = self.retry.run("download", destination, || {
            let mut response = ureq::get(url).call().map_err(io::Error::other)?;
            let total = response
                .headers()
                .get(ureq::http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .or(size);

            let mut body = response.body_mut().as_reader();
            let mut file = File::create(&fragment)?;
            let bytes = copy_with_progress(&mut body, &mut file, &mut |n| {
                reporter
                    .progress(CacheStep::Acquire, n, total)
                    .map_err(|_| canceled())
            })?;
            file.sync_all()?;
            Ok(bytes)
        });

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) if e.is_user_exit() => return Err(e),
            Err(e) => return Err(download_failed(url, e.to_string())),
        };

        fs::rename(&fragment, destination)?;
        Ok(bytes)
    }

    /// Fetch `<url>.sig` next to a downloaded artifact. A missing envelope is
    /// left for verification to reject.
    fn download_envelope(&self, url: &str, destination: &Path) {
        let envelope_url = format!("{url}.{SIGNATURE_SUFFIX}");
        let envelope = envelope_path(destination);
        let result = self.retry.run("download", &envelope, || {
            let mut response = ureq::get(&envelope_url).call().map_err(|e| match e {
                ureq::Error::StatusCode(404) => io::Error::from(io::ErrorKind::NotFound),
                e => io::Error::other(e),
            })?;
            let body = response.body_mut().read_to_vec().map_err(io::Error::other)?;
            fs::write(&envelope, body)
        });
        if let Err(e) = result {
            warn!(url = %envelope_url, error = %e, "signature envelope not downloaded");
        }
    }

    /// Carry the detached envelope of `source` to sit next to `destination`
    fn transfer_envelope(&self, source: &Path, destination: &Path, mode: TransferMode) -> Result<()> {
        let envelope = envelope_path(source);
        if !envelope.is_file() {
            debug!(path = %envelope.display(), "no signature envelope to carry");
            return Ok(());
        }
        transfer_file(&envelope, &envelope_path(destination), mode, &self.retry, &mut |_| Ok(()))?;
        Ok(())
    }

    /// Verify a container in place; a container that fails is deleted
    pub fn verify_container(&self, container: &Container, path: &Path) -> Result<u64> {
        let verification = container_verification(container);
        let expected = Expectation {
            id: &container.id,
            size: container.size,
            verification: &verification,
        };
        verify_or_delete(path, &expected, self.trust(), &self.retry)
    }

    /// Verify an acquired container and extract `payloads` from it into the working folder
    pub fn extract_container(
        &self,
        container: &Container,
        container_path: &Path,
        payloads: &[&Payload],
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<Vec<(String, PathBuf)>> {
        let working = self.working_folder()?.to_path_buf();
        let mut reporter = Reporter::new(&container.id, handler);

        let result = reporter
            .step(CacheStep::Verify, |_| {
                Ok(((), self.verify_container(container, container_path)?))
            })
            .and_then(|()| {
                reporter.step(CacheStep::Extract, |_| {
                    let extracted = extract_payloads(container_path, &working, payloads)?;
                    let missing: Vec<&str> = payloads
                        .iter()
                        .filter(|p| !extracted.iter().any(|(key, _)| key == &p.key))
                        .map(|p| p.key.as_str())
                        .collect();
                    if !missing.is_empty() {
                        return Err(operation_failed(format!(
                            "container '{}' does not contain payloads: {}",
                            container.id,
                            missing.join(", ")
                        )));
                    }
                    let bytes: u64 = extracted
                        .iter()
                        .filter_map(|(_, p)| fs::metadata(p).ok())
                        .map(|m| m.len())
                        .sum();
                    Ok((extracted, bytes))
                })
            });
        reporter.complete(result)
    }

    /// Stage, verify and promote a payload into its completed cache directory.
    ///
    /// A payload already present at its completed path that verifies is left
    /// untouched.
    pub fn complete_payload(
        &self,
        per_machine: bool,
        cache_id: &str,
        payload: &Payload,
        working_path: &Path,
        mode: TransferMode,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<PathBuf> {
        let mut reporter = Reporter::new(&payload.key, handler);
        let result = self.complete_payload_steps(
            per_machine,
            cache_id,
            payload,
            working_path,
            mode,
            &mut reporter,
        );
        reporter.complete(result)
    }

    fn complete_payload_steps(
        &self,
        per_machine: bool,
        cache_id: &str,
        payload: &Payload,
        working_path: &Path,
        mode: TransferMode,
        reporter: &mut Reporter<'_>,
    ) -> Result<PathBuf> {
        let completed_dir = self.completed_path(per_machine, cache_id).path;
        let completed = completed_dir.join(&payload.file_path);
        let expected = Expectation::for_payload(payload);

        if self.is_payload_cached(per_machine, cache_id, payload) {
            debug!(key = %payload.key, path = %completed.display(), "payload already cached");
            return Ok(completed);
        }

        let unverified = self.roots.unverified_path(per_machine, &payload.key);
        let size = payload.size;
        let signed = payload.verification.is_signed();

        reporter.step(CacheStep::Stage, |r| {
            let bytes = transfer_file(working_path, &unverified, mode, &self.retry, &mut |n| {
                r.progress(CacheStep::Stage, n, size).map_err(|_| canceled())
            })?;
            if signed {
                self.transfer_envelope(working_path, &unverified, mode)?;
            }
            Ok(((), bytes))
        })?;

        reporter.step(CacheStep::Verify, |_| {
            let bytes = verify_or_delete(&unverified, &expected, self.trust(), &self.retry)?;
            Ok(((), bytes))
        })?;

        reporter.step(CacheStep::Finalize, |r| {
            let destination_dir = completed.parent().unwrap_or(completed_dir.as_path());
            acl::reset_permissions(&unverified, destination_dir, &self.retry)?;
            if signed {
                let envelope = envelope_path(&unverified);
                if envelope.is_file() {
                    acl::reset_permissions(&envelope, destination_dir, &self.retry)?;
                }
                self.transfer_envelope(&unverified, &completed, TransferMode::Move)?;
            }
            let bytes = transfer_file(
                &unverified,
                &completed,
                TransferMode::Move,
                &self.retry,
                &mut |n| r.progress(CacheStep::Finalize, n, size).map_err(|_| canceled()),
            )?;
            info!(key = %payload.key, path = %completed.display(), "payload cached");
            Ok((completed.clone(), bytes))
        })
    }

    /// Verify a payload and copy or move it into a layout directory
    pub fn layout_payload(
        &self,
        layout_directory: &Path,
        payload: &Payload,
        working_path: &Path,
        mode: TransferMode,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<PathBuf> {
        let destination = layout_directory.join(payload.source_relative_path());
        let expected = Expectation::for_payload(payload);
        self.layout(&payload.key, &expected, working_path, &destination, mode, handler)
    }

    /// Verify a container and copy or move it into a layout directory
    pub fn layout_container(
        &self,
        layout_directory: &Path,
        container: &Container,
        working_path: &Path,
        mode: TransferMode,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<PathBuf> {
        let verification = container_verification(container);
        let expected = Expectation {
            id: &container.id,
            size: container.size,
            verification: &verification,
        };
        let destination = layout_directory.join(&container.file_path);
        self.layout(&container.id, &expected, working_path, &destination, mode, handler)
    }

    fn layout(
        &self,
        id: &str,
        expected: &Expectation<'_>,
        working_path: &Path,
        destination: &Path,
        mode: TransferMode,
        handler: &mut dyn CacheMessageHandler,
    ) -> Result<PathBuf> {
        let mut reporter = Reporter::new(id, handler);
        let size = expected.size;

        let result = reporter
            .step(CacheStep::Verify, |_| {
                Ok(((), verify_or_delete(working_path, expected, self.trust(), &self.retry)?))
            })
            .and_then(|()| {
                reporter.step(CacheStep::Finalize, |r| {
                    let destination_dir = destination.parent().unwrap_or(destination);
                    acl::reset_permissions(working_path, destination_dir, &self.retry)?;
                    if expected.verification.is_signed() {
                        self.transfer_envelope(working_path, destination, mode)?;
                    }
                    let bytes = transfer_file(working_path, destination, mode, &self.retry, &mut |n| {
                        r.progress(CacheStep::Finalize, n, size).map_err(|_| canceled())
                    })?;
                    Ok((destination.to_path_buf(), bytes))
                })
            });
        reporter.complete(result)
    }

    /// Verify a payload in its completed location; a corrupt payload is deleted
    pub fn verify_payload(&self, per_machine: bool, cache_id: &str, payload: &Payload) -> Result<PathBuf> {
        let path = self
            .completed_path(per_machine, cache_id)
            .path
            .join(&payload.file_path);
        verify_or_delete(
            &path,
            &Expectation::for_payload(payload),
            self.trust(),
            &self.retry,
        )?;
        Ok(path)
    }

    /// Remove a bundle's completed cache directory
    pub fn remove_bundle(&self, per_machine: bool, cache_id: &str) -> Result<()> {
        self.remove_cache_directory("bundle", per_machine, cache_id)
    }

    /// Remove a package's completed cache directory
    pub fn remove_package(&self, per_machine: bool, cache_id: &str) -> Result<()> {
        self.remove_cache_directory("package", per_machine, cache_id)
    }

    fn remove_cache_directory(&self, kind: &str, per_machine: bool, cache_id: &str) -> Result<()> {
        let completed = self.completed_path(per_machine, cache_id);
        info!(kind, cache_id, path = %completed.path.display(), "removing from cache");
        remove_dir_all_with_retry(&completed.path, &self.retry)?;

        let root = self.roots.root(per_machine);
        remove_if_empty(root);

        if completed.redirected {
            let historical_root = self.roots.default_per_machine_root();
            remove_dir_all_with_retry(&historical_root.join(cache_id), &self.retry)?;
            remove_if_empty(historical_root);
        }
        Ok(())
    }

    /// Remove the unverified staging area and sweep the per-user working folder
    pub fn cleanup(&self, per_machine: bool) -> Result<()> {
        let unverified = self.roots.unverified_dir(per_machine);
        remove_dir_all_with_retry(&unverified, &self.retry)?;
        remove_if_empty(self.roots.root(per_machine));

        if per_machine {
            return Ok(());
        }

        let Some(working) = self.working_folder.as_deref() else {
            return Ok(());
        };
        let Ok(entries) = fs::read_dir(working) else {
            return Ok(());
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() && !is_resume_fragment(&path) {
                if let Err(e) = remove_file_with_retry(&path, &self.retry) {
                    warn!(path = %path.display(), error = %e, "failed to remove working file");
                }
            }
        }
        debug!(path = %working.display(), "working folder swept");
        Ok(())
    }
}

/// Remove a directory only when it is empty; failures are ignored
fn remove_if_empty(dir: &Path) {
    if fs::read_dir(dir).is_ok_and(|mut d| d.next().is_none()) {
        let _ = fs::remove_dir(dir);
    }
}

/// Folder holding the bundle layout a local source was found in
fn source_folder_of(found: &Path, spec: &SourceSpec<'_>) -> Option<PathBuf> {
    [spec.source_path, Some(spec.relative_path)]
        .into_iter()
        .flatten()
        .map(Path::new)
        .filter(|form| form.is_relative() && found.ends_with(form))
        .find_map(|form| found.ancestors().nth(form.components().count()))
        .map(Path::to_path_buf)
}

fn extract_payloads(
    archive_path: &Path,
    working: &Path,
    payloads: &[&Payload],
) -> Result<Vec<(String, PathBuf)>> {
    let file = File::open(archive_path)?;
    let mut archive = tar::Archive::new(file);
    let mut extracted = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = normalize(&entry.path()?);

        let Some((payload, is_envelope)) = payloads.iter().find_map(|p| {
            let relative = normalize(Path::new(p.source_relative_path()));
            if relative == entry_path {
                Some((p, false))
            } else if p.verification.is_signed() && envelope_path(&relative) == entry_path {
                Some((p, true))
            } else {
                None
            }
        }) else {
            continue;
        };

        let destination = acquisition_path(working, &payload.key);
        if is_envelope {
            entry.unpack(envelope_path(&destination))?;
            continue;
        }
        entry.unpack(&destination)?;
        debug!(key = %payload.key, "extracted payload");
        extracted.push((payload.key.clone(), destination));
    }

    Ok(extracted)
}

fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
