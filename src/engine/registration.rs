//! Bundle registration and persisted state
//!
//! A registered bundle leaves two things behind:
//!
//! - a record in `<cache-root>/.registrations/<bundle-id>.json`, scanned by
//!   other bundles during Detect to find related bundles
//! - its engine binary, manifest and `state.json` (saved variables) in its
//!   completed cache directory, so it can be run again from the cache
//!
//! Per-machine registrations are written by the elevated companion.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cache::paths::safe_segment;
use crate::cache::transfer::{TransferMode, remove_file_with_retry, transfer_file};
use crate::cache::{Cache, CacheRoots};
use crate::config::manifest::MANIFEST_FILE;
use crate::domain::{RegistrationInfo, RegistrationRecord};
use crate::error::{
    Result,
    fs::{read_failed, write_failed},
};
use crate::variables::Variables;

/// Saved variables inside a bundle's completed cache directory
pub const STATE_FILE: &str = "state.json";

const RECORD_EXTENSION: &str = "json";

/// Registration records for one scope
#[derive(Debug, Clone)]
pub struct RegistrationStore {
    dir: PathBuf,
}

impl RegistrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn for_scope(roots: &CacheRoots, per_machine: bool) -> Self {
        Self::new(roots.registrations_dir(per_machine))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{RECORD_EXTENSION}", safe_segment(id)))
    }

    /// Write a record atomically
    pub fn write(&self, record: &RegistrationRecord) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| write_failed(&self.dir, &e))?;
        let path = self.record_path(&record.id);

        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| write_failed(&self.dir, &e))?;
        file.write_all(serde_json::to_string_pretty(record)?.as_bytes())
            .map_err(|e| write_failed(&path, &e))?;
        file.persist(&path)
            .map_err(|e| write_failed(&path, &e.error))?;

        debug!(id = %record.id, path = %path.display(), "registration written");
        Ok(())
    }

    pub fn read(&self, id: &str) -> Result<Option<RegistrationRecord>> {
        let path = self.record_path(id);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(read_failed(&path, &e)),
        }
    }

    /// Remove a record; a missing record is not an error
    pub fn remove(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(id, "registration removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(write_failed(&path, &e)),
        }
    }

    /// Every readable record, sorted by id; unreadable records are skipped
    pub fn list(&self) -> Result<Vec<RegistrationRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_failed(&self.dir, &e)),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|c| serde_json::from_str::<RegistrationRecord>(&c).map_err(|e| e.to_string()));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable registration"),
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// Path of the saved variables for a bundle
pub fn state_path(cache: &Cache, bundle: &RegistrationInfo) -> PathBuf {
    cache
        .completed_path(bundle.per_machine, &bundle.cache_id)
        .path
        .join(STATE_FILE)
}

/// Save variables for the next run
pub fn save_state(cache: &Cache, bundle: &RegistrationInfo, variables: &Variables) -> Result<()> {
    let path = state_path(cache, bundle);
    variables.save(&path)?;
    debug!(path = %path.display(), "state saved");
    Ok(())
}

/// Variables saved by an earlier run, if any
pub fn load_state(cache: &Cache, bundle: &RegistrationInfo) -> Result<Option<Variables>> {
    Variables::load(&state_path(cache, bundle))
}

/// Copy the engine binary and manifest into the bundle's completed cache directory
pub fn cache_bundle(
    cache: &Cache,
    bundle: &RegistrationInfo,
    engine_path: &Path,
    manifest_path: &Path,
) -> Result<PathBuf> {
    let dir = cache.completed_path(bundle.per_machine, &bundle.cache_id).path;
    let engine = dir.join(&bundle.executable_name);
    let manifest = dir.join(MANIFEST_FILE);

    for (source, destination) in [(engine_path, &engine), (manifest_path, &manifest)] {
        if dunce::canonicalize(source).ok() == dunce::canonicalize(destination).ok() && destination.is_file() {
            continue;
        }
        transfer_file(
            source,
            destination,
            TransferMode::Copy,
            cache.retry(),
            &mut |_| Ok(()),
        )?;
        crate::cache::acl::reset_permissions(destination, &dir, cache.retry())?;
    }

    debug!(path = %dir.display(), "bundle cached");
    Ok(dir)
}

/// Register the bundle: cache its engine and manifest, write its record
pub fn register(
    cache: &Cache,
    bundle: &RegistrationInfo,
    engine_path: &Path,
    manifest_path: &Path,
) -> Result<()> {
    cache_bundle(cache, bundle, engine_path, manifest_path)?;
    RegistrationStore::for_scope(cache.roots(), bundle.per_machine).write(&RegistrationRecord::from(bundle))
}

/// Remove the bundle's record and its cached engine, manifest and state
pub fn unregister(cache: &Cache, bundle: &RegistrationInfo) -> Result<()> {
    RegistrationStore::for_scope(cache.roots(), bundle.per_machine).remove(&bundle.id)?;
    let state = state_path(cache, bundle);
    remove_file_with_retry(&state, cache.retry())?;
    cache.remove_bundle(bundle.per_machine, &bundle.cache_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{KnownFolders, RetryPolicy};
    use crate::config::{EngineCommand, MachinePolicy};
    use tempfile::TempDir;

    fn bundle() -> RegistrationInfo {
        serde_yaml::from_str("id: acme\nname: Acme\nversion: 1.0.0\nupgrade_code: acme\ncache_id: acme-1\n")
            .unwrap()
    }

    fn cache(temp: &TempDir) -> Cache {
        Cache::with_folders(
            &KnownFolders {
                per_machine_data: temp.path().join("machine"),
                per_user_data: temp.path().join("user"),
            },
            &EngineCommand::default(),
            &MachinePolicy::default(),
        )
        .with_retry(RetryPolicy::immediate(1))
    }

    #[test]
    fn test_store_round_trip_and_listing() {
        let temp = TempDir::new().unwrap();
        let store = RegistrationStore::new(temp.path().join("regs"));
        assert!(store.list().unwrap().is_empty());
        assert!(store.read("acme").unwrap().is_none());

        let record = RegistrationRecord::from(&bundle());
        store.write(&record).unwrap();
        std::fs::write(store.dir().join("broken.json"), "{").unwrap();

        assert_eq!(store.read("acme").unwrap(), Some(record.clone()));
        assert_eq!(store.list().unwrap(), vec![record]);

        store.remove("acme").unwrap();
        store.remove("acme").unwrap();
        assert!(store.read("acme").unwrap().is_none());
    }

    #[test]
    fn test_register_and_unregister() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let engine = temp.path().join("setup");
        let manifest = temp.path().join(MANIFEST_FILE);
        std::fs::write(&engine, b"engine").unwrap();
        std::fs::write(&manifest, b"bundle: {}").unwrap();

        register(&cache, &bundle(), &engine, &manifest).unwrap();
        let dir = cache.completed_path(false, "acme-1").path;
        assert_eq!(std::fs::read(dir.join("setup")).unwrap(), b"engine");
        assert!(dir.join(MANIFEST_FILE).is_file());
        assert!(
            RegistrationStore::for_scope(cache.roots(), false)
                .read("acme")
                .unwrap()
                .is_some()
        );

        let mut variables = Variables::new();
        variables.set("InstallDir", "/opt/acme");
        save_state(&cache, &bundle(), &variables).unwrap();
        assert_eq!(load_state(&cache, &bundle()).unwrap(), Some(variables));

        unregister(&cache, &bundle()).unwrap();
        assert!(!dir.exists());
        assert!(load_state(&cache, &bundle()).unwrap().is_none());
        assert!(
            RegistrationStore::for_scope(cache.roots(), false)
                .list()
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn test_registering_from_the_cache_is_a_noop_copy() {
        let temp = TempDir::new().unwrap();
        let cache = cache(&temp);
        let dir = cache.completed_path(false, "acme-1").path;
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("setup"), b"engine").unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), b"bundle: {}").unwrap();

        cache_bundle(&cache, &bundle(), &dir.join("setup"), &dir.join(MANIFEST_FILE)).unwrap();
        assert_eq!(std::fs::read(dir.join("setup")).unwrap(), b"engine");
    }
}
