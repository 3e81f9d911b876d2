//! Archive unpacking: single-member gzip and whole-archive zip.
//!
//! Both formats extract into the staging directory first and land with a
//! rename. Zip extraction caps every decompressed file at [`MAX_UNPACKED_FILE_SIZE`]
//! and restores stored directory and file modes.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::error::{UpdateError, UpdateResult};
use crate::registry::Registry;

/// Upper bound on a single decompressed zip member.
pub(crate) const MAX_UNPACKED_FILE_SIZE: u64 = 1_000_000_000;

/// Unpack destination for an artifact: its storage path with the archive
/// extension stripped. `None` when the path has no extension.
pub(crate) fn unpacked_dir(artifact: &Path) -> Option<PathBuf> {
    artifact.extension()?;
    let stripped = artifact.with_extension("");
    (stripped != *artifact).then_some(stripped)
}

/// Stream-decode a single-member gzip file into `dest`.
pub(crate) fn unpack_gzip(tmp_dir: &Path, src: &Path, dest: &Path) -> UpdateResult<()> {
    let file = File::open(src).map_err(|e| UpdateError::io("opening archive", src, e))?;
    let mut decoder = GzDecoder::new(io::BufReader::new(file));

    let mut staged = tempfile::NamedTempFile::new_in(tmp_dir)
        .map_err(|e| UpdateError::io("creating staging file", tmp_dir, e))?;
    io::copy(&mut decoder, &mut staged)
        .map_err(|e| UpdateError::io("decoding gzip", src, e))?;
    staged.flush().map_err(|e| UpdateError::io("flushing staging file", staged.path(), e))?;
    staged
        .persist(dest)
        .map_err(|e| UpdateError::io("moving unpacked file into place", dest, e.error))?;
    Ok(())
}

/// Extract a zip archive into the directory `dest`.
pub(crate) fn unpack_zip(tmp_dir: &Path, src: &Path, dest: &Path) -> UpdateResult<()> {
    let subject = src.display().to_string();
    let file = File::open(src).map_err(|e| UpdateError::io("opening archive", src, e))?;
    let mut archive =
        ZipArchive::new(file).map_err(|e| UpdateError::parse(subject.as_str(), e.to_string()))?;

    let staged = tempfile::tempdir_in(tmp_dir)
        .map_err(|e| UpdateError::io("creating staging dir", tmp_dir, e))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| UpdateError::parse(subject.as_str(), e.to_string()))?;
        let Some(rel) = entry.enclosed_name() else {
            return Err(UpdateError::parse(
                subject.as_str(),
                format!("unsafe entry path {:?}", entry.name()),
            ));
        };
        let out = staged.path().join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)
                .map_err(|e| UpdateError::io("creating unpacked dir", &out, e))?;
            set_mode(&out, entry.unix_mode())?;
        } else {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| UpdateError::io("creating unpacked dir", parent, e))?;
            }
            let mut target =
                File::create(&out).map_err(|e| UpdateError::io("creating unpacked file", &out, e))?;
            let copied = io::copy(&mut (&mut entry).take(MAX_UNPACKED_FILE_SIZE + 1), &mut target)
                .map_err(|e| UpdateError::io("writing unpacked file", &out, e))?;
            if copied > MAX_UNPACKED_FILE_SIZE {
                return Err(UpdateError::UnpackedTooLarge {
                    path: entry.name().to_owned(),
                });
            }
            set_mode(&out, entry.unix_mode())?;
        }
    }

    let staged_path = staged.keep();
    if let Err(e) = std::fs::rename(&staged_path, dest) {
        let _ = std::fs::remove_dir_all(&staged_path);
        let _ = std::fs::remove_dir_all(dest);
        return Err(UpdateError::io("moving unpacked dir into place", dest, e));
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> UpdateResult<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .map_err(|e| UpdateError::io("setting unpacked mode", path, e))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> UpdateResult<()> {
    Ok(())
}

impl Registry {
    /// Unpack the selected, locally available artifact of a resource,
    /// returning the unpacked path. An existing destination is treated as
    /// already unpacked.
    ///
    /// # Errors
    ///
    /// `NotFound` / `NoSelectedVersion` / `NotAvailableLocally` for missing
    /// inputs, `UnsupportedArchive` for formats other than gzip and zip.
    pub fn ensure_unpacked(&self, identifier: &str) -> UpdateResult<PathBuf> {
        let resource = self
            .get_resource(identifier)
            .ok_or_else(|| UpdateError::NotFound(identifier.to_owned()))?;
        let selected = resource
            .selected_version()
            .ok_or_else(|| UpdateError::NoSelectedVersion(identifier.to_owned()))?;
        if !selected.available {
            return Err(UpdateError::NotAvailableLocally(identifier.to_owned()));
        }
        let (versioned, path) = self.storage_path_for(identifier, &selected.version);
        self.unpack_artifact(&versioned, &path)
    }

    pub(crate) fn unpack_artifact(&self, versioned: &str, path: &Path) -> UpdateResult<PathBuf> {
        let dest = unpacked_dir(path)
            .ok_or_else(|| UpdateError::UnsupportedArchive(versioned.to_owned()))?;
        if dest.exists() {
            debug!(path = %dest.display(), "already unpacked");
            return Ok(dest);
        }

        let tmp = self.cfg.tmp_dir();
        std::fs::create_dir_all(&tmp)
            .map_err(|e| UpdateError::io("creating tmp dir", &tmp, e))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("gz") => unpack_gzip(&tmp, path, &dest)?,
            Some("zip") => unpack_zip(&tmp, path, &dest)?,
            _ => return Err(UpdateError::UnsupportedArchive(versioned.to_owned())),
        }
        debug!(archive = %versioned, dest = %dest.display(), "unpacked");
        Ok(dest)
    }

    /// Unpack right after download when the identifier is configured for it.
    pub(crate) fn maybe_auto_unpack(&self, identifier: &str, versioned: &str, path: &Path) {
        if !self.cfg.auto_unpack.iter().any(|id| id == identifier) {
            return;
        }
        if let Err(e) = self.unpack_artifact(versioned, path) {
            warn!(identifier, error = %e, "auto-unpack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use zip::write::SimpleFileOptions;

    #[test]
    fn unpacked_dir_strips_the_extension() {
        assert_eq!(
            unpacked_dir(Path::new("/data/ui/app_v1-0-0.zip")),
            Some(PathBuf::from("/data/ui/app_v1-0-0"))
        );
        assert_eq!(unpacked_dir(Path::new("/data/core/portd_v1-0-0")), None);
    }

    #[test]
    fn gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();

        let archive = dir.path().join("intel_v1-0-0.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"intel feed contents").unwrap();
        std::fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let dest = dir.path().join("intel_v1-0-0");
        unpack_gzip(&tmp, &archive, &dest).unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"intel feed contents");
    }

    #[test]
    fn zip_extraction_recreates_tree() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();

        let archive = dir.path().join("ui_v1-0-0.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .add_directory("assets/", SimpleFileOptions::default())
                .unwrap();
            writer
                .start_file(
                    "assets/index.html",
                    SimpleFileOptions::default().unix_permissions(0o644),
                )
                .unwrap();
            writer.write_all(b"<html></html>").unwrap();
            writer
                .start_file("run.sh", SimpleFileOptions::default().unix_permissions(0o755))
                .unwrap();
            writer.write_all(b"#!/bin/sh\n").unwrap();
            writer.finish().unwrap();
        }

        let dest = dir.path().join("ui_v1-0-0");
        unpack_zip(&tmp, &archive, &dest).unwrap();
        assert_eq!(
            std::fs::read(dest.join("assets/index.html")).unwrap(),
            b"<html></html>"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dest.join("run.sh")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[test]
    fn zip_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(&tmp).unwrap();

        let archive = dir.path().join("evil_v1-0-0.zip");
        {
            let file = File::create(&archive).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("../escape.txt", SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"nope").unwrap();
            writer.finish().unwrap();
        }

        let dest = dir.path().join("evil_v1-0-0");
        let err = unpack_zip(&tmp, &archive, &dest);
        assert!(err.is_err());
        assert!(!dest.exists());
    }
}
