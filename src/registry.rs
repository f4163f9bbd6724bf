//! Process-wide table of managed servers.
//!
//! The registry is the only component that creates or deletes programs, the
//! join point for orchestrated shutdown, and the seam between the control
//! plane and per-server state. Backed by `DashMap` so lookups never observe a
//! partially constructed program.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};
use ulid::Ulid;

use crate::console::{ConsoleBuffer, DEFAULT_MAX_AGE, DEFAULT_MAX_LINES};
use crate::env::EnvError;
use crate::program::{Program, ProgramError, ServerDefinition};
use crate::store::{ConfigStore, StoreError};

/// How long a deleted server gets to exit after the stop request before it is
/// killed.
const DELETE_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server already exists: {0}")]
    AlreadyExists(String),

    #[error("server not found: {0}")]
    NotFound(String),

    #[error("registry is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Registry construction parameters.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Parent directory for per-server data directories.
    pub servers_dir: PathBuf,
    pub console_lines: usize,
    pub console_age: Duration,
}

impl RegistrySettings {
    pub fn new(servers_dir: impl Into<PathBuf>) -> Self {
        Self {
            servers_dir: servers_dir.into(),
            console_lines: DEFAULT_MAX_LINES,
            console_age: DEFAULT_MAX_AGE,
        }
    }
}

pub struct Registry {
    programs: DashMap<String, Arc<Program>>,
    store: Arc<dyn ConfigStore>,
    settings: RegistrySettings,
    draining: AtomicBool,
}

impl Registry {
    pub fn new(store: Arc<dyn ConfigStore>, settings: RegistrySettings) -> Self {
        Self {
            programs: DashMap::new(),
            store,
            settings,
            draining: AtomicBool::new(false),
        }
    }

    fn build_program(&self, id: String, definition: ServerDefinition) -> Arc<Program> {
        let data_dir = self.settings.servers_dir.join(&id);
        let console = ConsoleBuffer::new(self.settings.console_lines, self.settings.console_age);
        Program::new(id, definition, data_dir, self.store.clone(), console)
    }

    /// Create and persist a new server.
    ///
    /// The identifier is generated when not supplied. Downstream activation
    /// failures are the caller's to roll back via [`delete`](Registry::delete);
    /// the registry does not auto-rollback.
    pub async fn create(
        &self,
        id: Option<String>,
        definition: ServerDefinition,
    ) -> Result<Arc<Program>> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }
        definition.requirements.test()?;

        let id = id.unwrap_or_else(|| Ulid::new().to_string().to_lowercase());
        let program = self.build_program(id.clone(), definition);

        match self.programs.entry(id.clone()) {
            Entry::Occupied(_) => return Err(RegistryError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(program.clone());
            }
        }

        tokio::fs::create_dir_all(program.data_dir())
            .await
            .map_err(StoreError::Io)?;
        program.activate(HashMap::new()).await?;
        program.save().await?;
        info!(server = %id, "Server created");
        Ok(program)
    }

    /// Look up a server. Never allocates an entry as a side effect.
    pub fn get(&self, id: &str) -> Option<Arc<Program>> {
        self.programs.get(id).map(|entry| entry.value().clone())
    }

    /// Point-in-time snapshot of all known servers.
    pub fn get_all(&self) -> Vec<Arc<Program>> {
        self.programs
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Stop, tear down, and forget a server. Idempotent: deleting an unknown
    /// or already-stopped server succeeds.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let Some((_, program)) = self.programs.remove(id) else {
            // Entry may have been half-created; clear persisted state anyway.
            self.store.delete(id).await?;
            return Ok(());
        };

        match program.stop().await {
            Ok(()) | Err(ProgramError::Env(EnvError::NotRunning)) => {}
            Err(e) => warn!(server = %id, error = %e, "Stop during delete failed"),
        }
        if !program
            .environment()
            .wait_for_main_process_for(DELETE_GRACE)
            .await
        {
            let _ = program.kill().await;
            program.environment().wait_for_main_process().await;
        }
        program.scheduler().stop();

        self.store.delete(id).await?;
        if program.data_dir().exists() {
            if let Err(e) = tokio::fs::remove_dir_all(program.data_dir()).await {
                warn!(server = %id, error = %e, "Failed to remove server data directory");
            }
        }

        info!(server = %id, "Server deleted");
        Ok(())
    }

    /// Re-read persisted configuration into the in-memory program without
    /// replacing its environment or scheduler.
    pub async fn reload(&self, id: &str) -> Result<()> {
        let program = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let persisted = self.store.load(id).await?;
        program.replace_definition(persisted.definition).await;
        info!(server = %id, "Server configuration reloaded");
        Ok(())
    }

    /// Persist a server's current in-memory configuration.
    pub async fn save(&self, id: &str) -> Result<()> {
        let program = self
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        program.save().await?;
        Ok(())
    }

    /// Populate the registry from the backing store and start every server's
    /// scheduler. Unreadable persisted state is an error, never a silent
    /// default.
    pub async fn load_all(&self) -> Result<usize> {
        let ids = self.store.list_ids().await?;
        let mut loaded = 0usize;
        for id in ids {
            let persisted = self.store.load(&id).await?;
            let program = self.build_program(id.clone(), persisted.definition);
            self.programs.insert(id.clone(), program.clone());
            if let Err(e) = program.activate(persisted.tasks).await {
                warn!(server = %id, error = %e, "Failed to activate server, removing");
                self.delete(&id).await?;
                continue;
            }
            loaded += 1;
        }
        info!(count = loaded, "Servers loaded");
        Ok(loaded)
    }

    /// Mark the registry as draining: no new creates. Existing servers are
    /// unaffected until explicitly stopped.
    pub fn shutdown_service(&self) {
        self.draining.store(true, Ordering::SeqCst);
        info!("Registry draining, no new servers accepted");
    }

    /// Orchestrated shutdown: request stop for every server, give each the
    /// same bounded grace period in parallel, then kill stragglers. Total
    /// wait is bounded by `grace` regardless of fleet size.
    pub async fn stop_all(&self, grace: Duration) {
        let programs = self.get_all();
        info!(count = programs.len(), grace_secs = grace.as_secs(), "Stopping all servers");

        join_all(programs.iter().map(|program| async move {
            match program.stop().await {
                Ok(()) | Err(ProgramError::Env(EnvError::NotRunning)) => {}
                Err(e) => {
                    warn!(server = %program.id(), error = %e, "Stop failed during shutdown");
                }
            }
            if !program.environment().wait_for_main_process_for(grace).await {
                warn!(server = %program.id(), "Grace period elapsed, killing");
                let _ = program.kill().await;
                program.environment().wait_for_main_process().await;
            }
            program.scheduler().stop();
        }))
        .await;

        info!("All servers stopped");
    }
}
