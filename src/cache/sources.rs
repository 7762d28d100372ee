//! Local source resolution
//!
//! Builds the ordered list of places a payload or container source might be
//! found on disk before falling back to a download.

use std::path::{Path, PathBuf};

/// Folders sources are resolved against
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFolders {
    /// Folder the running (or original) bootstrapper lives in
    pub process_folder: Option<PathBuf>,
    /// Folder a source was last found in, when remembered from an earlier run
    pub last_used_folder: Option<PathBuf>,
}

/// What is being looked for
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceRequest<'a> {
    /// Relative path of the artifact inside the bundle layout
    pub relative_path: &'a str,
    /// Authored source path; may be absolute
    pub source_path: Option<&'a str>,
    /// Where the artifact is being acquired to
    pub destination: Option<&'a Path>,
    /// Layout directory when laying out the bundle
    pub layout_directory: Option<&'a Path>,
}

/// Ordered candidate locations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCandidates {
    pub paths: Vec<PathBuf>,
    /// Candidate a user is most likely able to fix (never the destination)
    pub likely: Option<usize>,
    pub destination: Option<usize>,
}

impl SourceCandidates {
    /// First candidate that exists as a file
    pub fn first_existing(&self) -> Option<(usize, &Path)> {
        self.paths
            .iter()
            .enumerate()
            .find(|(_, p)| p.is_file())
            .map(|(i, p)| (i, p.as_path()))
    }

    fn push(&mut self, path: PathBuf) -> usize {
        if let Some(existing) = self.paths.iter().position(|p| *p == path) {
            return existing;
        }
        self.paths.push(path);
        self.paths.len() - 1
    }
}

/// Candidate locations in priority order: an absolute source path, the
/// destination, the process folder, the last used folder and the layout
/// directory, first for the source path and again for the relative path when
/// the two differ.
pub fn local_source_paths(folders: &SourceFolders, request: &SourceRequest<'_>) -> SourceCandidates {
    let mut candidates = SourceCandidates::default();
    let primary = request.source_path.unwrap_or(request.relative_path);

    let mut forms = vec![primary];
    if primary != request.relative_path {
        forms.push(request.relative_path);
    }

    for form in forms {
        let form_path = Path::new(form);

        if form_path.is_absolute() {
            candidates.push(form_path.to_path_buf());
            push_destination(&mut candidates, request.destination);
            continue;
        }

        push_destination(&mut candidates, request.destination);

        if let Some(folder) = &folders.process_folder {
            let index = candidates.push(folder.join(form_path));
            if folders.last_used_folder.is_none() {
                set_likely(&mut candidates, Some(index));
            }
        }

        if let Some(folder) = &folders.last_used_folder {
            if folders.process_folder.as_ref() != Some(folder) {
                let index = candidates.push(folder.join(form_path));
                set_likely(&mut candidates, Some(index));
            } else {
                let index = candidates
                    .paths
                    .iter()
                    .position(|p| *p == folder.join(form_path));
                set_likely(&mut candidates, index);
            }
        }

        if let Some(layout) = request.layout_directory {
            candidates.push(layout.join(form_path));
        }
    }

    candidates
}

fn push_destination(candidates: &mut SourceCandidates, destination: Option<&Path>) {
    if let Some(destination) = destination {
        let index = candidates.push(destination.to_path_buf());
        candidates.destination.get_or_insert(index);
    }
}

fn set_likely(candidates: &mut SourceCandidates, index: Option<usize>) {
    if candidates.likely.is_none() && index != candidates.destination {
        candidates.likely = index;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn folders() -> SourceFolders {
        SourceFolders {
            process_folder: Some(PathBuf::from("/run")),
            last_used_folder: Some(PathBuf::from("/media/dvd")),
        }
    }

    #[test]
    fn test_candidate_order() {
        let request = SourceRequest {
            relative_path: "payloads/app.bin",
            source_path: None,
            destination: Some(Path::new("/work/app.bin")),
            layout_directory: Some(Path::new("/layout")),
        };

        let candidates = local_source_paths(&folders(), &request);
        assert_eq!(
            candidates.paths,
            vec![
                PathBuf::from("/work/app.bin"),
                PathBuf::from("/run/payloads/app.bin"),
                PathBuf::from("/media/dvd/payloads/app.bin"),
                PathBuf::from("/layout/payloads/app.bin"),
            ]
        );
        assert_eq!(candidates.destination, Some(0));
        assert_eq!(candidates.likely, Some(2));
    }

    #[test]
    fn test_absolute_source_path_comes_first() {
        let request = SourceRequest {
            relative_path: "app.bin",
            source_path: Some("/mnt/share/app.bin"),
            destination: Some(Path::new("/work/app.bin")),
            layout_directory: None,
        };

        let candidates = local_source_paths(&folders(), &request);
        assert_eq!(candidates.paths[0], PathBuf::from("/mnt/share/app.bin"));
        assert_eq!(candidates.destination, Some(1));
        assert!(candidates.paths.contains(&PathBuf::from("/run/app.bin")));
    }

    #[test]
    fn test_destination_follows_lone_absolute_path() {
        let request = SourceRequest {
            relative_path: "/mnt/share/app.bin",
            source_path: None,
            destination: Some(Path::new("/work/app.bin")),
            layout_directory: Some(Path::new("/layout")),
        };

        let candidates = local_source_paths(&folders(), &request);
        assert_eq!(
            candidates.paths,
            vec![PathBuf::from("/mnt/share/app.bin"), PathBuf::from("/work/app.bin")]
        );
        assert_eq!(candidates.destination, Some(1));
        assert_eq!(candidates.likely, None);
    }

    #[test]
    fn test_secondary_relative_form_is_searched() {
        let request = SourceRequest {
            relative_path: "app.bin",
            source_path: Some("redist/app.bin"),
            destination: None,
            layout_directory: None,
        };

        let candidates = local_source_paths(&folders(), &request);
        assert_eq!(
            candidates.paths,
            vec![
                PathBuf::from("/run/redist/app.bin"),
                PathBuf::from("/media/dvd/redist/app.bin"),
                PathBuf::from("/run/app.bin"),
                PathBuf::from("/media/dvd/app.bin"),
            ]
        );
        assert_eq!(candidates.likely, Some(1));
    }

    #[test]
    fn test_likely_is_process_folder_without_last_used() {
        let folders = SourceFolders {
            process_folder: Some(PathBuf::from("/run")),
            last_used_folder: None,
        };
        let request = SourceRequest {
            relative_path: "app.bin",
            destination: Some(Path::new("/work/app.bin")),
            ..SourceRequest::default()
        };

        let candidates = local_source_paths(&folders, &request);
        assert_eq!(candidates.likely, Some(1));
        assert_ne!(candidates.likely, candidates.destination);
    }

    #[test]
    fn test_same_last_used_and_process_folder_not_duplicated() {
        let folders = SourceFolders {
            process_folder: Some(PathBuf::from("/run")),
            last_used_folder: Some(PathBuf::from("/run")),
        };
        let request = SourceRequest {
            relative_path: "app.bin",
            ..SourceRequest::default()
        };

        let candidates = local_source_paths(&folders, &request);
        assert_eq!(candidates.paths, vec![PathBuf::from("/run/app.bin")]);
        assert_eq!(candidates.likely, Some(0));
    }

    #[test]
    fn test_first_existing() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::write(temp.path().join("app.bin"), b"x").unwrap();
        let missing = temp.path().join("missing.bin");
        let folders = SourceFolders {
            process_folder: Some(temp.path().to_path_buf()),
            last_used_folder: None,
        };
        let request = SourceRequest {
            relative_path: "app.bin",
            destination: Some(&missing),
            ..SourceRequest::default()
        };

        let candidates = local_source_paths(&folders, &request);
        let (index, path) = candidates.first_existing().unwrap();
        assert_eq!(index, 1);
        assert_eq!(path, temp.path().join("app.bin"));
    }
}
