//! Cache engine
//!
//! The package cache is a per-machine and per-user store of verified
//! artifacts keyed by cache id:
//!
//! - per-machine: `<ProgramData|/var/lib>/Package Cache/<cache-id>/`, redirectable
//!   by the `package_cache_folder` machine policy
//! - per-user: `<local data>/Package Cache/<cache-id>/`
//! - `.unverified/` under each root stages artifacts until they verify
//! - a per-run working folder `<base>/<uuid>/` holds acquisitions, with `.be`
//!   (staged engine binary) and `.cr` (clean room) subfolders
//!
//! Artifacts flow acquire → stage → verify → reset permissions → promote. An
//! artifact that fails verification is deleted and never promoted.

pub mod acl;
pub mod message;
pub mod operations;
pub mod paths;
pub mod signature;
pub mod sources;
pub mod stats;
pub mod transaction;
pub mod transfer;
pub mod verify;

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

pub use message::{CacheMessage, CacheMessageHandler, CacheReply, CacheStep, IgnoreMessages};
pub use operations::Acquired;
pub use paths::{CacheRoots, CompletedPath, KnownFolders};
pub use signature::{Ed25519TrustProvider, TrustProvider};
pub use sources::{SourceCandidates, SourceFolders, SourceRequest};
pub use stats::{CacheStats, CachedEntry};
pub use transaction::{CacheRemover, CacheTransaction};
pub use transfer::{RetryPolicy, TransferMode};

use crate::config::{EngineCommand, MachinePolicy};
use crate::domain::RegistrationInfo;
use crate::error::{BootstrapError, Result, engine::precondition, fs::write_failed};
use crate::temp;
use crate::variables::{
    BUNDLE_LAST_USED_SOURCE, BUNDLE_ORIGINAL_SOURCE, BUNDLE_ORIGINAL_SOURCE_FOLDER, Variables,
};

/// Process-wide cache state for one engine instance
#[derive(Debug)]
pub struct Cache {
    roots: CacheRoots,
    run_id: String,
    command_working_base: Option<PathBuf>,
    policy_working_base: Option<PathBuf>,
    working_folder: Option<PathBuf>,
    working_folder_hardened: bool,
    sources: SourceFolders,
    running_from_cache: bool,
    retry: RetryPolicy,
    trust: Box<dyn TrustProvider>,
}

impl Cache {
    /// Resolve cache roots from known folders and machine policy
    pub fn initialize(command: &EngineCommand, policy: &MachinePolicy) -> Result<Self> {
        let folders = KnownFolders::resolve()?;
        Ok(Self::with_folders(&folders, command, policy))
    }

    /// Build a cache over explicit known folders
    pub fn with_folders(folders: &KnownFolders, command: &EngineCommand, policy: &MachinePolicy) -> Self {
        let roots = CacheRoots::new(folders, policy.package_cache_folder.as_deref());
        let run_id = uuid::Uuid::new_v4().to_string();

        debug!(
            per_machine = %roots.root(true).display(),
            per_user = %roots.root(false).display(),
            redirected = roots.is_redirected(),
            run_id,
            "cache initialized"
        );

        Self {
            roots,
            run_id,
            command_working_base: command.working_directory.clone(),
            policy_working_base: policy.engine_working_directory.clone(),
            working_folder: None,
            working_folder_hardened: false,
            sources: SourceFolders::default(),
            running_from_cache: false,
            retry: policy.retry.map(RetryPolicy::from).unwrap_or_default(),
            trust: Box::new(Ed25519TrustProvider::default()),
        }
    }

    pub fn with_trust_provider(mut self, trust: Box<dyn TrustProvider>) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reuse a run id, so an elevated companion shares its parent's working folder name
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn roots(&self) -> &CacheRoots {
        &self.roots
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn trust(&self) -> &dyn TrustProvider {
        self.trust.as_ref()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn source_folders(&self) -> &SourceFolders {
        &self.sources
    }

    pub fn is_running_from_cache(&self) -> bool {
        self.running_from_cache
    }

    /// Final cache directory for `cache_id`, see [`CacheRoots::completed_path`]
    pub fn completed_path(&self, per_machine: bool, cache_id: &str) -> CompletedPath {
        self.roots.completed_path(per_machine, cache_id)
    }

    /// The working folder, once [`Cache::ensure_base_working_folder`] has created it
    pub fn working_folder(&self) -> Result<&Path> {
        self.working_folder
            .as_deref()
            .ok_or_else(|| precondition("working folder has not been created"))
    }

    /// Create the per-run working folder under the first usable base.
    ///
    /// Bases are tried in order: the command's working directory, the policy's
    /// working directory (elevated only), then the system temp directory when
    /// elevated or the user temp directory otherwise. When elevated the folder
    /// is restricted to administrators.
    pub fn ensure_base_working_folder(&mut self, elevated: bool) -> Result<PathBuf> {
        if let Some(existing) = &self.working_folder {
            if existing.is_dir() {
                if elevated && !self.working_folder_hardened {
                    acl::harden_directory(existing, &self.retry)?;
                    self.working_folder_hardened = true;
                }
                return Ok(existing.clone());
            }
        }

        let mut candidates = Vec::new();
        if let Some(base) = &self.command_working_base {
            candidates.push(base.clone());
        }
        if elevated {
            if let Some(base) = &self.policy_working_base {
                candidates.push(base.clone());
            }
            candidates.push(temp::system_temp_dir());
        } else {
            candidates.push(temp::user_temp_dir());
        }

        for base in &candidates {
            let folder = paths::working_folder(base, &self.run_id);
            match std::fs::create_dir_all(&folder) {
                Ok(()) => {
                    if elevated {
                        acl::harden_directory(&folder, &self.retry)?;
                        self.working_folder_hardened = true;
                    }
                    info!(path = %folder.display(), elevated, "working folder ready");
                    self.working_folder = Some(folder.clone());
                    return Ok(folder);
                }
                Err(e) => {
                    warn!(base = %base.display(), error = %e, "working folder base unusable");
                }
            }
        }

        Err(BootstrapError::NoUsableWorkingFolder {
            candidates: candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
    }

    /// Record where sources are resolved from.
    ///
    /// Detects whether the engine is running from its own completed cache
    /// directory. When it is not, and no original source was recorded by an
    /// earlier run, the current process location becomes the original source.
    pub fn initialize_sources(
        &mut self,
        registration: &RegistrationInfo,
        variables: &mut Variables,
        command: &EngineCommand,
    ) -> Result<()> {
        let engine_path = match &command.engine_path {
            Some(path) => path.clone(),
            None => std::env::current_exe()?,
        };
        let engine_path = dunce::canonicalize(&engine_path).unwrap_or(engine_path);
        let engine_folder = engine_path.parent().map(Path::to_path_buf);

        let completed = self
            .completed_path(registration.per_machine, &registration.cache_id)
            .path;
        let completed = dunce::canonicalize(&completed).unwrap_or(completed);
        self.running_from_cache = engine_folder.as_deref() == Some(completed.as_path());

        let source_process = command.source_process.clone().unwrap_or(engine_path);

        if !self.running_from_cache && !variables.contains(BUNDLE_ORIGINAL_SOURCE) {
            variables.set(BUNDLE_ORIGINAL_SOURCE, source_process.display().to_string());
            if let Some(folder) = source_process.parent() {
                variables.set(BUNDLE_ORIGINAL_SOURCE_FOLDER, folder.display().to_string());
            }
        }

        self.sources.process_folder = if self.running_from_cache {
            variables
                .get(BUNDLE_ORIGINAL_SOURCE_FOLDER)
                .map(PathBuf::from)
                .or(engine_folder)
        } else {
            source_process.parent().map(Path::to_path_buf)
        };
        self.sources.last_used_folder = variables.get(BUNDLE_LAST_USED_SOURCE).map(PathBuf::from);

        debug!(
            running_from_cache = self.running_from_cache,
            process_folder = ?self.sources.process_folder,
            last_used = ?self.sources.last_used_folder,
            "sources initialized"
        );
        Ok(())
    }

    /// Candidate locations for a source, see [`sources::local_source_paths`]
    pub fn local_source_paths(&self, request: &SourceRequest<'_>) -> SourceCandidates {
        sources::local_source_paths(&self.sources, request)
    }

    /// Stage the engine binary into `.be` so it can be launched elevated.
    ///
    /// Returns the staged path; an already staged binary is reused.
    pub fn cache_bundle_engine(&self, engine_path: &Path, executable_name: &str) -> Result<PathBuf> {
        let staging = paths::bundle_working_dir(self.working_folder()?);
        let staged = staging.join(paths::safe_segment(executable_name));
        if staged.is_file() {
            return Ok(staged);
        }

        std::fs::create_dir_all(&staging).map_err(|e| write_failed(&staging, &e))?;
        transfer::transfer_file(
            engine_path,
            &staged,
            TransferMode::Copy,
            &self.retry,
            &mut |_| Ok(()),
        )?;
        debug!(path = %staged.display(), "engine binary staged");
        Ok(staged)
    }

    /// Best-effort removal of the working folder at the end of a run
    pub fn remove_working_folder(&self) {
        if let Some(folder) = &self.working_folder {
            if let Err(e) = transfer::remove_dir_all_with_retry(folder, &self.retry) {
                warn!(path = %folder.display(), error = %e, "failed to remove working folder");
            }
        }
    }
}
