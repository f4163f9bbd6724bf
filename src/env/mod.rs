//! Execution environment abstraction.
//!
//! A server's underlying process can run under different strategies (native
//! process today; containerized or remote agents are future strategies). The
//! [`Environment`] trait is the capability set every strategy implements;
//! callers hold `Arc<dyn Environment>` and never branch on the concrete kind.

mod native;

pub use native::NativeEnvironment;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::console::{ConsoleBuffer, Listener};
use crate::files::FileSandbox;

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    #[error("server process has no input channel")]
    InputUnavailable,

    #[error("failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, EnvError>;

/// Point-in-time resource usage of the main process.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessStats {
    /// CPU utilization in percent.
    pub cpu: f64,
    /// Resident memory in bytes.
    pub memory: f64,
}

/// How a graceful stop is requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopMethod {
    /// Write a command to the process's stdin (e.g. `stop` for Minecraft).
    Command { command: String },
    /// Send a signal to the process (SIGTERM by default).
    Signal { signal: i32 },
}

impl Default for StopMethod {
    fn default() -> Self {
        StopMethod::Signal { signal: libc::SIGTERM }
    }
}

/// Fully rendered launch parameters for the main process.
///
/// Variable substitution has already been applied by the owning program;
/// strategies consume this as-is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub stop: StopMethod,
}

/// Execution strategy selector, persisted with the server definition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Native,
}

/// Capability set every execution strategy implements for one server.
///
/// Invariant: at most one live process handle per environment; starting while
/// running fails with [`EnvError::AlreadyRunning`] rather than spawning twice.
#[async_trait]
pub trait Environment: Send + Sync {
    /// Launch the main process and begin capturing its output.
    async fn start(&self) -> Result<()>;

    /// Request graceful termination. Returns immediately; callers that need
    /// to observe the exit combine this with [`wait_for_main_process`].
    ///
    /// [`wait_for_main_process`]: Environment::wait_for_main_process
    async fn stop(&self) -> Result<()>;

    /// Forceful termination. Always safe on a stopped environment.
    async fn kill(&self) -> Result<()>;

    /// Block the calling task until the main process exits.
    async fn wait_for_main_process(&self);

    /// Like [`wait_for_main_process`](Environment::wait_for_main_process) but
    /// gives up after `timeout`. Returns true if the process exited. Does not
    /// kill on timeout.
    async fn wait_for_main_process_for(&self, timeout: Duration) -> bool;

    /// Current liveness, reflecting asynchronous exits without a prior wait.
    fn is_running(&self) -> bool;

    /// Resource usage snapshot for the running process.
    async fn get_stats(&self) -> Result<ProcessStats>;

    /// Write a line to the process's input channel.
    async fn send_input(&self, line: &str) -> Result<()>;

    /// The console buffer this environment writes into.
    fn console(&self) -> &ConsoleBuffer;

    /// File operations, confined to this server's data directory.
    fn sandbox(&self) -> &FileSandbox;

    /// The server's data directory.
    fn working_directory(&self) -> &Path;

    /// Retained console lines with epoch >= `epoch`, plus the next cursor.
    fn get_console_from(&self, epoch: i64) -> (Vec<String>, i64) {
        self.console().read_from(epoch)
    }

    /// Register a live console subscriber (future output only).
    fn add_listener(&self, listener: Listener) {
        self.console().add_listener(listener);
    }
}

/// Build an environment for the given strategy.
pub fn create_environment(
    kind: StrategyKind,
    server_id: String,
    launch: Arc<tokio::sync::RwLock<LaunchConfig>>,
    working_dir: PathBuf,
    console: ConsoleBuffer,
) -> Arc<dyn Environment> {
    match kind {
        StrategyKind::Native => Arc::new(NativeEnvironment::new(
            server_id,
            launch,
            working_dir,
            console,
        )),
    }
}
