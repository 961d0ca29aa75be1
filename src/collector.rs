//! Source tree collection.
//!
//! Walks the source root without following symbolic links and returns every
//! regular file the include/exclude policy admits, ordered by normalized
//! path.  Per file, the policy is evaluated in priority order:
//!
//! 1. a file name in the mandatory-include set is always collected;
//! 2. otherwise a path segment equal to an exclusion pattern, or a file name
//!    matching an exclusion glob, skips the file;
//! 3. otherwise the file is collected.

use std::collections::BTreeSet;
use std::path::{Component, Path};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::PublishError;
use crate::model::{FileEntry, FileFailure, FileMode};

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Collected because the name is in the mandatory-include set.
    ForceInclude,
    Exclude,
    Include,
}

#[derive(Debug, Clone)]
pub struct CollectPolicy {
    always_include: BTreeSet<String>,
    exclude: Vec<(String, glob::Pattern)>,
}

impl CollectPolicy {
    pub fn new<I, E>(always_include: I, exclude: E) -> Result<Self, glob::PatternError>
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        let exclude = exclude
            .into_iter()
            .map(|raw| glob::Pattern::new(&raw).map(|p| (raw, p)))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            always_include: always_include.into_iter().collect(),
            exclude,
        })
    }

    pub fn from_config(config: &SourceConfig) -> Result<Self, glob::PatternError> {
        Self::new(
            config.always_include.iter().cloned(),
            config.exclude.iter().cloned(),
        )
    }

    /// Classify a `/`-separated path relative to the source root.
    pub fn decide(&self, rel_path: &str) -> Decision {
        let file_name = rel_path.rsplit('/').next().unwrap_or(rel_path);
        if self.always_include.contains(file_name) {
            return Decision::ForceInclude;
        }

        let excluded = self.exclude.iter().any(|(raw, pattern)| {
            rel_path.split('/').any(|segment| segment == raw) || pattern.matches(file_name)
        });
        if excluded {
            Decision::Exclude
        } else {
            Decision::Include
        }
    }
}

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// Result of walking the source tree.
#[derive(Debug, Default)]
pub struct Collection {
    /// Collected files, sorted by path.
    pub entries: Vec<FileEntry>,
    /// Files that passed the policy but could not be read.
    pub unreadable: Vec<FileFailure>,
    pub excluded: usize,
    pub total_bytes: u64,
}

/// Join the components of `rel` with `/`, rejecting non-UTF-8 names.
fn normalize(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> FileMode {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        FileMode::Executable
    } else {
        FileMode::Regular
    }
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> FileMode {
    FileMode::Regular
}

/// Walk `root` and read every admitted file.
///
/// Blocking; run it under `spawn_blocking` from async code.
#[instrument(skip(policy), fields(root = %root.display()))]
pub fn collect(root: &Path, policy: &CollectPolicy) -> Result<Collection, PublishError> {
    let mut collection = Collection::default();

    for item in WalkDir::new(root).follow_links(false) {
        let item = match item {
            Ok(item) => item,
            Err(e) if e.depth() == 0 => {
                return Err(PublishError::Collection(format!(
                    "cannot read {}: {e}",
                    root.display()
                )));
            }
            Err(e) => {
                let path = e
                    .path()
                    .and_then(|p| p.strip_prefix(root).ok())
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                if policy.decide(&path) == Decision::Exclude {
                    debug!(%path, error = %e, "unreadable entry is excluded");
                    continue;
                }
                warn!(%path, error = %e, "cannot read directory entry");
                collection.unreadable.push(FileFailure {
                    path,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        // Symlinks are reported as such because links are not followed.
        if !item.file_type().is_file() {
            continue;
        }

        let Ok(rel) = item.path().strip_prefix(root) else {
            continue;
        };
        let Some(path) = normalize(rel) else {
            let lossy = rel.to_string_lossy().into_owned();
            warn!(path = %lossy, "skipping file with a non UTF-8 path");
            collection.unreadable.push(FileFailure {
                path: lossy,
                reason: "path is not valid UTF-8".to_string(),
            });
            continue;
        };

        match policy.decide(&path) {
            Decision::Exclude => {
                debug!(%path, "excluded");
                collection.excluded += 1;
                continue;
            }
            Decision::ForceInclude => debug!(%path, "always included"),
            Decision::Include => {}
        }

        let read = item
            .metadata()
            .map_err(|e| e.to_string())
            .and_then(|meta| {
                std::fs::read(item.path())
                    .map(|content| (content, file_mode(&meta)))
                    .map_err(|e| e.to_string())
            });
        match read {
            Ok((content, mode)) => {
                collection.total_bytes += content.len() as u64;
                collection.entries.push(FileEntry::new(path, content, mode));
            }
            Err(reason) => {
                warn!(%path, %reason, "cannot read file");
                collection.unreadable.push(FileFailure { path, reason });
            }
        }
    }

    collection.entries.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        files = collection.entries.len(),
        bytes = collection.total_bytes,
        excluded = collection.excluded,
        unreadable = collection.unreadable.len(),
        "source tree collected"
    );
    Ok(collection)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(include: &[&str], exclude: &[&str]) -> CollectPolicy {
        CollectPolicy::new(
            include.iter().map(|s| s.to_string()),
            exclude.iter().map(|s| s.to_string()),
        )
        .unwrap()
    }

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    fn paths(collection: &Collection) -> Vec<&str> {
        collection.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn decide_matches_directory_segments_and_file_globs() {
        let p = policy(&["README.md"], &["node_modules", "*.log"]);
        assert_eq!(p.decide("src/main.rs"), Decision::Include);
        assert_eq!(p.decide("node_modules/x/index.js"), Decision::Exclude);
        assert_eq!(p.decide("logs/app.log"), Decision::Exclude);
        assert_eq!(p.decide("node_modules/x/README.md"), Decision::ForceInclude);
        // Plain names are not substring matches.
        assert_eq!(p.decide("my_node_modules/a.js"), Decision::Include);
    }

    #[test]
    fn excluded_directory_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "b.txt", "b");
        write(dir.path(), "node_modules/ignored.txt", "x");

        let c = collect(dir.path(), &policy(&[], &["node_modules"])).unwrap();
        assert_eq!(paths(&c), vec!["a.txt", "b.txt"]);
        assert_eq!(c.excluded, 1);
        assert_eq!(c.total_bytes, 2);
    }

    #[test]
    fn mandatory_include_bypasses_exclusion() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ".env", "SECRET=1");
        write(dir.path(), ".env.example", "SECRET=");

        let c = collect(dir.path(), &policy(&[".env.example"], &[".env", ".env.*"])).unwrap();
        assert_eq!(paths(&c), vec![".env.example"]);
    }

    #[test]
    fn order_is_lexicographic_by_full_path() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a/b.txt", "1");
        write(dir.path(), "a.txt", "2");
        write(dir.path(), "Z.txt", "3");
        write(dir.path(), "a/a/c.txt", "4");

        let c = collect(dir.path(), &policy(&[], &[])).unwrap();
        assert_eq!(paths(&c), vec!["Z.txt", "a.txt", "a/a/c.txt", "a/b.txt"]);
    }

    #[test]
    fn directories_are_never_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        let c = collect(dir.path(), &policy(&[], &[])).unwrap();
        assert!(c.entries.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        write(outside.path(), "secret.txt", "outside");

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "inside.txt", "inside");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link_dir")).unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link_file.txt"),
        )
        .unwrap();

        let c = collect(dir.path(), &policy(&[], &[])).unwrap();
        assert_eq!(paths(&c), vec!["inside.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn executable_bit_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run.sh", "#!/bin/sh\n");
        write(dir.path(), "notes.txt", "n");
        std::fs::set_permissions(
            dir.path().join("run.sh"),
            std::fs::Permissions::from_mode(0o755),
        )
        .unwrap();

        let c = collect(dir.path(), &policy(&[], &[])).unwrap();
        let modes: Vec<_> = c.entries.iter().map(|e| (e.path.as_str(), e.mode)).collect();
        assert_eq!(
            modes,
            vec![("notes.txt", FileMode::Regular), ("run.sh", FileMode::Executable)]
        );
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directories_count_only_outside_exclusions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "a");
        write(dir.path(), "node_modules/locked/x.js", "x");
        write(dir.path(), "src/locked/y.rs", "y");
        let locked = [
            dir.path().join("node_modules/locked"),
            dir.path().join("src/locked"),
        ];
        for path in &locked {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o000)).unwrap();
        }
        // Permission bits do not stop root.
        let denied = std::fs::read_dir(&locked[0]).is_err();

        let c = collect(dir.path(), &policy(&[], &["node_modules"]));
        for path in &locked {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        if !denied {
            return;
        }

        let c = c.unwrap();
        assert_eq!(paths(&c), vec!["a.txt"]);
        let unreadable: Vec<_> = c.unreadable.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(unreadable, vec!["src/locked"]);
    }

    #[test]
    fn missing_root_is_a_collection_error() {
        let err = collect(Path::new("/nonexistent/forgepublish-src"), &policy(&[], &[]))
            .unwrap_err();
        assert!(matches!(err, PublishError::Collection(_)));
    }
}
