//! Storage tree maintenance: discovery scan, symlink projection, staging
//! hygiene, and atomic writes.
//!
//! All writes stage inside the registry tmp directory (same filesystem as
//! the storage tree) and land with a single rename, so readers observe
//! either the previous state or the complete new one.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{UpdateError, UpdateResult};
use crate::filename;
use crate::registry::Registry;
use crate::resource::AddVersionOpts;

/// Wipe and recreate the staging directory.
pub(crate) fn clean_tmp(tmp: &Path) -> UpdateResult<()> {
    match std::fs::remove_dir_all(tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(UpdateError::io("wiping tmp dir", tmp, e)),
    }
    std::fs::create_dir_all(tmp).map_err(|e| UpdateError::io("creating tmp dir", tmp, e))
}

/// Write bytes to `dest` atomically: stage in `tmp_dir`, set the mode, then
/// rename into place. The staged file is removed on any failure.
pub(crate) fn write_atomic(
    tmp_dir: &Path,
    dest: &Path,
    bytes: &[u8],
    mode: u32,
) -> UpdateResult<()> {
    std::fs::create_dir_all(tmp_dir)
        .map_err(|e| UpdateError::io("creating tmp dir", tmp_dir, e))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| UpdateError::io("creating parent dir", parent, e))?;
    }

    let mut staged = tempfile::NamedTempFile::new_in(tmp_dir)
        .map_err(|e| UpdateError::io("creating staging file", tmp_dir, e))?;
    staged
        .write_all(bytes)
        .map_err(|e| UpdateError::io("writing staging file", staged.path(), e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(|e| UpdateError::io("setting file mode", staged.path(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    staged
        .persist(dest)
        .map_err(|e| UpdateError::io("moving file into place", dest, e.error))?;
    Ok(())
}

impl Registry {
    /// Walk the storage tree and register every versioned file found.
    ///
    /// Skips the tmp directory, signature companions, and directories whose
    /// name decodes to an identifier (unpacked artifact roots). Returns the
    /// number of versions registered.
    ///
    /// # Errors
    ///
    /// Fails when `root` lies outside the storage directory or the walk
    /// itself fails; individual bad entries are logged and skipped.
    pub fn scan_storage(&self, root: Option<&Path>) -> UpdateResult<usize> {
        let storage_root = self.cfg.storage_root.clone();
        let root = root.map_or_else(|| storage_root.clone(), Path::to_path_buf);
        if !root.starts_with(&storage_root) {
            return Err(UpdateError::InvalidPath {
                path: root,
                reason: "scan root is outside the storage directory",
            });
        }

        let tmp = self.cfg.tmp_dir();
        let walker = WalkDir::new(&root).into_iter().filter_entry(move |entry| {
            if entry.path() == tmp {
                return false;
            }
            if entry.file_type().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    // Unpacked artifact roots are not scannable content.
                    if filename::parse_versioned_path(name).is_some() {
                        return false;
                    }
                }
            }
            true
        });

        let mut registered = 0;
        for entry in walker {
            let entry =
                entry.map_err(|e| UpdateError::io("scanning storage", &root, e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "sig") {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&storage_root) else {
                continue;
            };
            let Some(rel) = rel.to_str() else {
                warn!(path = %path.display(), "non-UTF-8 path in storage, skipped");
                continue;
            };
            let rel = rel.replace('\\', "/");
            let Some((identifier, version)) = filename::parse_versioned_path(&rel) else {
                debug!(path = %rel, "unversioned file in storage, skipped");
                continue;
            };

            let resource = self.get_or_create_resource(&identifier);
            match resource.add_version(
                &storage_root,
                &version,
                AddVersionOpts {
                    available: true,
                    ..Default::default()
                },
            ) {
                Ok(_) => registered += 1,
                Err(e) => warn!(path = %rel, error = %e, "undecodable version on disk, skipped"),
            }
        }

        // A full scan is authoritative: anything still marked available
        // without a backing file loses the flag.
        if root == storage_root {
            for resource in self.resource_snapshot() {
                resource.refresh_availability(&storage_root);
            }
        }
        info!(root = %root.display(), registered, "storage scan complete");
        Ok(registered)
    }

    /// Wipe `root` and project an unversioned symlink tree: one relative
    /// link per resource, pointing at the selected version's storage path.
    ///
    /// # Errors
    ///
    /// Fails when any resource has no selected version, or when `root`
    /// overlaps the storage tree.
    #[cfg(unix)]
    pub fn create_symlinks(&self, root: &Path) -> UpdateResult<()> {
        let storage_root = &self.cfg.storage_root;
        if storage_root.starts_with(root) {
            return Err(UpdateError::InvalidPath {
                path: root.to_path_buf(),
                reason: "symlink root would wipe the storage directory",
            });
        }

        match std::fs::remove_dir_all(root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(UpdateError::io("wiping symlink root", root, e)),
        }
        std::fs::create_dir_all(root)
            .map_err(|e| UpdateError::io("creating symlink root", root, e))?;

        for resource in self.resource_snapshot() {
            let identifier = resource.identifier();
            let selected = resource
                .selected_version()
                .ok_or_else(|| UpdateError::NoSelectedVersion(identifier.to_owned()))?;

            let (_, target) = self.storage_path_for(identifier, &selected.version);
            let link = root.join(identifier);
            let parent = link.parent().unwrap_or(root);
            std::fs::create_dir_all(parent)
                .map_err(|e| UpdateError::io("creating symlink dir", parent, e))?;

            let relative = relative_path(parent, &target);
            std::os::unix::fs::symlink(&relative, &link)
                .map_err(|e| UpdateError::io("creating symlink", &link, e))?;
            debug!(link = %link.display(), target = %relative.display(), "symlink created");
        }
        Ok(())
    }
}

/// Relative path from `from_dir` to `to`, built from the common prefix.
fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<Component<'_>> = from_dir.components().collect();
    let to: Vec<Component<'_>> = to.components().collect();
    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..from.len() {
        rel.push("..");
    }
    for component in &to[common..] {
        rel.push(component.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}
