//! Path-confined file operations for a server's data directory.
//!
//! Every caller-supplied path is resolved against the sandbox root and must
//! stay inside it after normalization and symlink resolution. Escapes fail
//! with [`FileError::IllegalFileAccess`] before any I/O touches the target.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("illegal file access: {0}")]
    IllegalFileAccess(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FileError>;

/// One entry of a directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    pub modify_time: DateTime<Utc>,
    pub is_directory: bool,
}

/// Outcome of [`FileSandbox::get_item`]: a directory listing or a readable
/// file. Callers distinguish the two rather than relying on errors.
pub enum FileRequest {
    Listing(Vec<FileEntry>),
    Contents {
        name: String,
        size: u64,
        file: fs::File,
    },
}

/// Path-confined view over one server's data directory.
pub struct FileSandbox {
    root: PathBuf,
}

impl FileSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path against the root, rejecting anything that
    /// escapes it.
    ///
    /// Traversal components are normalized lexically; the nearest existing
    /// ancestor of the result is then canonicalized to catch symlink escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf> {
        let requested = Path::new(path);
        if requested.is_absolute() {
            return Err(FileError::IllegalFileAccess(path.to_string()));
        }

        let mut resolved = self.root.clone();
        let mut depth = 0usize;
        for component in requested.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(FileError::IllegalFileAccess(path.to_string()));
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FileError::IllegalFileAccess(path.to_string()));
                }
            }
        }

        let canonical_root = self.root.canonicalize()?;
        let mut probe = resolved.clone();
        while !probe.exists() && probe.pop() {}
        let canonical = probe.canonicalize()?;
        if !canonical.starts_with(&canonical_root) {
            return Err(FileError::IllegalFileAccess(path.to_string()));
        }

        Ok(resolved)
    }

    /// The sandbox-relative form of a resolved path, used for archive entry
    /// names.
    pub(crate) fn relative_name(&self, resolved: &Path) -> PathBuf {
        resolved
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| resolved.to_path_buf())
    }

    /// Fetch a directory listing or a readable file stream.
    pub async fn get_item(&self, path: &str) -> Result<FileRequest> {
        let resolved = self.resolve(path)?;
        let meta = fs::metadata(&resolved)
            .await
            .map_err(|e| not_found(e, path))?;

        if meta.is_dir() {
            let mut entries = Vec::new();
            let mut dir = fs::read_dir(&resolved).await?;
            while let Some(entry) = dir.next_entry().await? {
                let meta = entry.metadata().await?;
                entries.push(FileEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: meta.len(),
                    modify_time: meta.modified().map(DateTime::from).unwrap_or_else(|_| Utc::now()),
                    is_directory: meta.is_dir(),
                });
            }
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(FileRequest::Listing(entries))
        } else {
            let file = fs::File::open(&resolved).await?;
            let name = resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            Ok(FileRequest::Contents {
                name,
                size: meta.len(),
                file,
            })
        }
    }

    /// Open a file for writing, creating it (and missing parents) as needed.
    pub async fn open_file(&self, path: &str) -> Result<fs::File> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&resolved)
            .await?;
        Ok(file)
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        fs::create_dir_all(&resolved).await?;
        Ok(())
    }

    /// Delete a file or directory (recursively). The root itself cannot be
    /// deleted.
    pub async fn delete_item(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path)?;
        if resolved == self.root {
            return Err(FileError::IllegalFileAccess(path.to_string()));
        }
        let meta = fs::metadata(&resolved)
            .await
            .map_err(|e| not_found(e, path))?;
        if meta.is_dir() {
            fs::remove_dir_all(&resolved).await?;
        } else {
            fs::remove_file(&resolved).await?;
        }
        Ok(())
    }
}

fn not_found(err: std::io::Error, path: &str) -> FileError {
    if err.kind() == ErrorKind::NotFound {
        FileError::NotFound(path.to_string())
    } else {
        FileError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, FileSandbox) {
        let tmp = TempDir::new().unwrap();
        let sandbox = FileSandbox::new(tmp.path());
        (tmp, sandbox)
    }

    #[test]
    fn resolve_rejects_absolute_paths() {
        let (_tmp, sandbox) = sandbox();
        assert!(matches!(
            sandbox.resolve("/etc/passwd"),
            Err(FileError::IllegalFileAccess(_))
        ));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (_tmp, sandbox) = sandbox();
        assert!(matches!(
            sandbox.resolve("../../etc/passwd"),
            Err(FileError::IllegalFileAccess(_))
        ));
        assert!(matches!(
            sandbox.resolve("sub/../../escape"),
            Err(FileError::IllegalFileAccess(_))
        ));
    }

    #[test]
    fn resolve_allows_interior_traversal() {
        let (tmp, sandbox) = sandbox();
        let resolved = sandbox.resolve("sub/dir/../file.txt").unwrap();
        assert_eq!(resolved, tmp.path().join("sub/file.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_rejects_symlink_escape() {
        let (tmp, sandbox) = sandbox();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("leak")).unwrap();

        assert!(matches!(
            sandbox.resolve("leak/secret.txt"),
            Err(FileError::IllegalFileAccess(_))
        ));
    }

    #[tokio::test]
    async fn get_item_distinguishes_files_and_directories() {
        let (tmp, sandbox) = sandbox();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/a.txt"), b"hello").unwrap();

        match sandbox.get_item("sub").await.unwrap() {
            FileRequest::Listing(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].name, "a.txt");
                assert_eq!(entries[0].size, 5);
                assert!(!entries[0].is_directory);
            }
            FileRequest::Contents { .. } => panic!("expected listing"),
        }

        match sandbox.get_item("sub/a.txt").await.unwrap() {
            FileRequest::Contents { name, size, .. } => {
                assert_eq!(name, "a.txt");
                assert_eq!(size, 5);
            }
            FileRequest::Listing(_) => panic!("expected contents"),
        }
    }

    #[tokio::test]
    async fn missing_item_is_not_found() {
        let (_tmp, sandbox) = sandbox();
        assert!(matches!(
            sandbox.get_item("nope.txt").await,
            Err(FileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_refuses_root() {
        let (_tmp, sandbox) = sandbox();
        assert!(matches!(
            sandbox.delete_item("").await,
            Err(FileError::IllegalFileAccess(_))
        ));
    }
}
