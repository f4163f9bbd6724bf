//! Persisted server configuration.
//!
//! The registry talks to a [`ConfigStore`] trait object; the shipped backend
//! keeps one JSON document per server, written atomically via tmp + rename.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::program::ServerDefinition;
use crate::scheduler::Task;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no stored configuration for server: {0}")]
    NotFound(String),

    #[error("corrupt stored configuration: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Everything persisted for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedProgram {
    pub definition: ServerDefinition,
    #[serde(default)]
    pub tasks: HashMap<String, Task>,
}

/// Load/save/delete of server definitions and task maps, keyed by identifier.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<PersistedProgram>;
    async fn save(&self, id: &str, program: &PersistedProgram) -> Result<()>;
    /// Idempotent: deleting an absent entry is not an error.
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// File-backed store: `<dir>/<id>.json`.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn load(&self, id: &str) -> Result<PersistedProgram> {
        let content = match fs::read_to_string(self.path_for(id)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()));
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        // Unreadable persisted state surfaces as Corrupt, never a default.
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, id: &str, program: &PersistedProgram) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(program)?;
        let path = self.path_for(id);
        let tmp = self.dir.join(format!("{id}.json.tmp"));
        fs::write(&tmp, json.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;
        debug!(server = %id, path = %path.display(), "Saved server configuration");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(StoreError::Io(e)),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().into_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
