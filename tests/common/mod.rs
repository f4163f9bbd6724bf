//! Shared test fixtures.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use berth::env::StopMethod;
use berth::program::{RunConfig, ServerDefinition};
use berth::registry::{Registry, RegistrySettings};
use berth::store::{ConfigStore, FileConfigStore, PersistedProgram, StoreError};

/// A registry rooted in a temp directory. Keep the fixture alive for the
/// duration of the test; dropping it removes all server data.
pub struct Fixture {
    pub tmp: TempDir,
    pub store: Arc<FileConfigStore>,
    pub registry: Registry,
}

pub fn test_registry() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FileConfigStore::new(tmp.path().join("definitions")));
    let registry = Registry::new(
        store.clone(),
        RegistrySettings::new(tmp.path().join("servers")),
    );
    Fixture {
        tmp,
        store,
        registry,
    }
}

pub fn shell_definition(script: &str) -> ServerDefinition {
    ServerDefinition {
        display: "test server".to_string(),
        run: RunConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Prints a marker then idles; exits promptly on SIGTERM.
pub fn echo_definition(marker: &str) -> ServerDefinition {
    shell_definition(&format!("echo {marker}; sleep 30"))
}

/// Ignores SIGTERM; only SIGKILL ends it. Prints "armed" once the trap is
/// installed; wait for that line before sending the stop, or the signal can
/// race the trap and terminate the shell after all.
pub fn stubborn_definition() -> ServerDefinition {
    shell_definition("trap '' TERM; echo armed; sleep 60")
}

/// Poll the console until `marker` appears in the output.
pub async fn wait_for_output(program: &std::sync::Arc<berth::Program>, marker: &str) -> bool {
    wait_until(|| {
        let (lines, _) = program.get_console_from(0);
        lines.iter().any(|l| l.contains(marker))
    })
    .await
}

/// Exits cleanly when `quit` arrives on stdin.
pub fn console_stop_definition() -> ServerDefinition {
    let mut definition = shell_definition("while read line; do [ \"$line\" = quit ] && exit 0; done");
    definition.run.stop = StopMethod::Command {
        command: "quit".to_string(),
    };
    definition
}

/// Store wrapper whose saves can be made to fail on demand.
pub struct FailingStore {
    inner: FileConfigStore,
    fail_saves: AtomicBool,
}

impl FailingStore {
    pub fn new(dir: &std::path::Path) -> Self {
        Self {
            inner: FileConfigStore::new(dir),
            fail_saves: AtomicBool::new(false),
        }
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigStore for FailingStore {
    async fn load(&self, id: &str) -> Result<PersistedProgram, StoreError> {
        self.inner.load(id).await
    }

    async fn save(&self, id: &str, program: &PersistedProgram) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("simulated save failure")));
        }
        self.inner.save(id, program).await
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_ids(&self) -> Result<Vec<String>, StoreError> {
        self.inner.list_ids().await
    }
}

/// Poll until `check` passes or ~5 seconds elapse.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    false
}
