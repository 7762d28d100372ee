//! Content store paths
//!
//! Pure path computation for the package cache: per-machine and per-user
//! roots (with policy redirection), completed artifact directories, the
//! `.unverified` staging area and the per-run working folder.

use std::path::{Path, PathBuf};

use crate::error::{BootstrapError, Result};

/// Directory name of a cache root under its known folder
pub const PACKAGE_CACHE_FOLDER: &str = "Package Cache";

/// Staging subfolder holding transferred but not yet verified artifacts
pub const UNVERIFIED_FOLDER: &str = ".unverified";

/// Working subfolder where the engine binary is staged for elevation
pub const BUNDLE_WORKING_FOLDER: &str = ".be";

/// Working subfolder holding the clean-room copy of the engine
pub const CLEAN_ROOM_FOLDER: &str = ".cr";

/// Subfolder of a cache root holding registration records
pub const REGISTRATIONS_FOLDER: &str = ".registrations";

/// Extension of resumable download fragments
pub const RESUME_FRAGMENT_EXTENSION: &str = "R";

/// Characters that cannot appear in a single path segment
const SEGMENT_UNSAFE_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Base folders the cache roots live under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownFolders {
    pub per_machine_data: PathBuf,
    pub per_user_data: PathBuf,
}

impl KnownFolders {
    /// Resolve the platform's machine-wide and per-user application data folders
    pub fn resolve() -> Result<Self> {
        let per_user_data =
            dirs::data_local_dir().ok_or_else(|| BootstrapError::KnownFolderUnavailable {
                folder: "local application data".to_string(),
            })?;

        Ok(Self {
            per_machine_data: machine_data_dir(),
            per_user_data,
        })
    }
}

#[cfg(windows)]
fn machine_data_dir() -> PathBuf {
    std::env::var_os("PROGRAMDATA").map_or_else(|| PathBuf::from("C:\\ProgramData"), PathBuf::from)
}

#[cfg(not(windows))]
fn machine_data_dir() -> PathBuf {
    PathBuf::from("/var/lib")
}

/// A completed cache directory and whether the redirected per-machine root was in play
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPath {
    pub path: PathBuf,
    pub redirected: bool,
}

/// Resolved cache roots for one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheRoots {
    per_machine_default: PathBuf,
    per_machine_current: PathBuf,
    per_user: PathBuf,
}

impl CacheRoots {
    /// Build the roots from known folders and an optional policy redirection
    pub fn new(folders: &KnownFolders, redirected_per_machine: Option<&Path>) -> Self {
        let per_machine_default = folders.per_machine_data.join(PACKAGE_CACHE_FOLDER);
        let per_machine_current = redirected_per_machine
            .map_or_else(|| per_machine_default.clone(), Path::to_path_buf);

        Self {
            per_machine_default,
            per_machine_current,
            per_user: folders.per_user_data.join(PACKAGE_CACHE_FOLDER),
        }
    }

    /// Current cache root for a scope
    pub fn root(&self, per_machine: bool) -> &Path {
        if per_machine {
            &self.per_machine_current
        } else {
            &self.per_user
        }
    }

    /// Historical per-machine root, regardless of redirection
    pub fn default_per_machine_root(&self) -> &Path {
        &self.per_machine_default
    }

    /// Whether machine policy moved the per-machine root
    pub fn is_redirected(&self) -> bool {
        self.per_machine_current != self.per_machine_default
    }

    /// Final cache directory for `cache_id`.
    ///
    /// When the per-machine root is redirected and the redirected directory does
    /// not exist but the historical default one does, the historical directory is
    /// returned so caches written before the redirection stay reachable.
    pub fn completed_path(&self, per_machine: bool, cache_id: &str) -> CompletedPath {
        let current = self.root(per_machine).join(cache_id);

        if !per_machine || !self.is_redirected() {
            return CompletedPath {
                path: current,
                redirected: false,
            };
        }

        if !current.is_dir() {
            let historical = self.per_machine_default.join(cache_id);
            if historical.is_dir() {
                return CompletedPath {
                    path: historical,
                    redirected: true,
                };
            }
        }

        CompletedPath {
            path: current,
            redirected: true,
        }
    }

    /// Staging directory under the current root for a scope
    pub fn unverified_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join(UNVERIFIED_FOLDER)
    }

    /// Staging path of an artifact identified by `key`
    pub fn unverified_path(&self, per_machine: bool, key: &str) -> PathBuf {
        self.unverified_dir(per_machine).join(safe_segment(key))
    }

    /// Directory holding registration records for a scope
    pub fn registrations_dir(&self, per_machine: bool) -> PathBuf {
        self.root(per_machine).join(REGISTRATIONS_FOLDER)
    }
}

/// Per-run working folder under a base directory
pub fn working_folder(base: &Path, run_id: &str) -> PathBuf {
    base.join(run_id)
}

pub fn bundle_working_dir(working_folder: &Path) -> PathBuf {
    working_folder.join(BUNDLE_WORKING_FOLDER)
}

pub fn clean_room_dir(working_folder: &Path) -> PathBuf {
    working_folder.join(CLEAN_ROOM_FOLDER)
}

/// Acquisition path of a payload or container inside the working folder
pub fn acquisition_path(working_folder: &Path, key: &str) -> PathBuf {
    working_folder.join(safe_segment(key))
}

/// Whether a file is a resumable download fragment
pub fn is_resume_fragment(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(RESUME_FRAGMENT_EXTENSION))
}

/// Replace characters that would split `key` into several path segments
pub fn safe_segment(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| if SEGMENT_UNSAFE_CHARS.contains(&c) { '_' } else { c })
        .collect();

    match safe.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => safe,
    }
}
