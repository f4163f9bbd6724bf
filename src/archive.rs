//! Archive packing and confined extraction for sandboxed files.
//!
//! Supports plain tar and gzip-compressed tar, picked by file extension.
//! Extraction validates every entry path before unpacking anything, so a
//! hostile archive cannot write outside the sandbox.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::files::{FileError, FileSandbox, Result};

fn is_gzipped(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz") || name.ends_with(".gz")
}

impl FileSandbox {
    /// Pack the named items into a single archive at `destination`.
    ///
    /// Sources and destination are both confined to the sandbox; directories
    /// are added recursively under their sandbox-relative names.
    pub async fn archive_items(&self, files: &[String], destination: &str) -> Result<()> {
        let dest = self.resolve(destination)?;
        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            let resolved = self.resolve(file)?;
            if !resolved.exists() {
                return Err(FileError::NotFound(file.clone()));
            }
            sources.push((resolved.clone(), self.relative_name(&resolved)));
        }

        debug!(destination = %dest.display(), count = sources.len(), "Packing archive");

        tokio::task::spawn_blocking(move || pack(&dest, &sources))
            .await
            .map_err(|e| FileError::Io(std::io::Error::other(e)))?
    }

    /// Unpack an archive into `destination`.
    ///
    /// The whole operation fails with [`FileError::IllegalFileAccess`] before
    /// any file is written if any entry carries an absolute or traversal path.
    pub async fn extract(&self, archive_path: &str, destination: &str) -> Result<()> {
        let archive = self.resolve(archive_path)?;
        if !archive.exists() {
            return Err(FileError::NotFound(archive_path.to_string()));
        }
        let dest = self.resolve(destination)?;

        debug!(archive = %archive.display(), destination = %dest.display(), "Extracting archive");

        tokio::task::spawn_blocking(move || {
            validate_entries(&archive)?;
            unpack(&archive, &dest)
        })
        .await
        .map_err(|e| FileError::Io(std::io::Error::other(e)))?
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(path)?;
    if is_gzipped(path) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn pack(dest: &Path, sources: &[(PathBuf, PathBuf)]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest)?;
    let writer: Box<dyn Write> = if is_gzipped(dest) {
        Box::new(GzEncoder::new(file, Compression::default()))
    } else {
        Box::new(file)
    };

    let mut builder = tar::Builder::new(writer);
    for (abs, rel) in sources {
        if abs.is_dir() {
            builder.append_dir_all(rel, abs)?;
        } else {
            builder.append_path_with_name(abs, rel)?;
        }
    }
    builder.into_inner()?.flush()?;
    Ok(())
}

/// First pass: walk every entry header and reject unsafe paths.
fn validate_entries(archive: &Path) -> Result<()> {
    let mut tar = tar::Archive::new(open_reader(archive)?);
    for entry in tar.entries()? {
        let entry = entry?;
        let path = entry
            .path()
            .map_err(|e| FileError::InvalidArchive(e.to_string()))?;
        if !entry_path_is_safe(&path) {
            return Err(FileError::IllegalFileAccess(
                path.to_string_lossy().into_owned(),
            ));
        }
    }
    Ok(())
}

fn entry_path_is_safe(path: &Path) -> bool {
    if path.is_absolute() {
        return false;
    }
    let mut depth = 0isize;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Second pass: unpack for real.
fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut tar = tar::Archive::new(open_reader(archive)?);
    tar.set_overwrite(true);
    tar.unpack(dest)?;
    Ok(())
}
