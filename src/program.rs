//! A managed server: configuration, execution environment, scheduler.
//!
//! The program is the unit the control plane operates on. It delegates
//! execution to its environment, maintenance to its scheduler, and file
//! access to the environment's sandbox, adding server context to errors
//! without swallowing their kind.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::console::{ConsoleBuffer, Listener};
use crate::env::{
    create_environment, EnvError, Environment, LaunchConfig, ProcessStats, StopMethod,
    StrategyKind,
};
use crate::files::{FileError, FileRequest};
use crate::scheduler::{Scheduler, SchedulerError, Task, TaskAction, TaskRunner};
use crate::store::{ConfigStore, PersistedProgram, StoreError};

/// How long a scheduled restart waits for a voluntary exit before killing.
const RESTART_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid configuration: {0}")]
    InvalidInput(String),

    #[error("install failed: {0}")]
    InstallFailed(String),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ProgramError>;

/// A named, typed, user-editable configuration value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub user_editable: bool,
    #[serde(default)]
    pub required: bool,
}

/// Launch parameters before variable substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub stop: StopMethod,
}

/// Preconditions a host must satisfy before a server may be created.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub binaries: Vec<String>,
}

impl Requirements {
    pub fn test(&self) -> Result<()> {
        if let Some(os) = &self.os {
            if os != std::env::consts::OS {
                return Err(ProgramError::InvalidInput(format!(
                    "requires os {os}, host is {}",
                    std::env::consts::OS
                )));
            }
        }
        if let Some(arch) = &self.arch {
            if arch != std::env::consts::ARCH {
                return Err(ProgramError::InvalidInput(format!(
                    "requires arch {arch}, host is {}",
                    std::env::consts::ARCH
                )));
            }
        }
        for binary in &self.binaries {
            if !binary_available(binary) {
                return Err(ProgramError::InvalidInput(format!(
                    "required binary not found: {binary}"
                )));
            }
        }
        Ok(())
    }
}

fn binary_available(binary: &str) -> bool {
    if binary.contains('/') {
        return std::path::Path::new(binary).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| {
            std::env::split_paths(&paths).any(|dir| dir.join(binary).is_file())
        })
        .unwrap_or(false)
}

/// The persisted server definition: what to run and how it is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerDefinition {
    #[serde(default)]
    pub display: String,
    #[serde(default)]
    pub strategy: StrategyKind,
    #[serde(default)]
    pub run: RunConfig,
    /// Ordered by name; values support `${name}` substitution into the run
    /// command and arguments.
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    /// Shell commands executed in the data directory by `install`.
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub requirements: Requirements,
}

impl ServerDefinition {
    fn render_launch(&self) -> LaunchConfig {
        LaunchConfig {
            command: substitute(&self.run.command, &self.variables),
            args: self
                .run
                .args
                .iter()
                .map(|a| substitute(a, &self.variables))
                .collect(),
            environment: self
                .run
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), substitute(v, &self.variables)))
                .collect(),
            stop: self.run.stop.clone(),
        }
    }
}

/// Replace `${name}` references with variable values. Unknown references are
/// left intact.
fn substitute(input: &str, variables: &BTreeMap<String, Variable>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match variables.get(key) {
                    Some(variable) => out.push_str(&value_as_string(&variable.value)),
                    None => {
                        out.push_str("${");
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// One managed server instance.
pub struct Program {
    id: String,
    definition: RwLock<ServerDefinition>,
    /// Rendered launch parameters shared with the environment; re-rendered
    /// whenever the definition or its variables change.
    launch: Arc<RwLock<LaunchConfig>>,
    environment: Arc<dyn Environment>,
    scheduler: Scheduler,
    store: Arc<dyn ConfigStore>,
    data_dir: PathBuf,
}

impl Program {
    pub fn new(
        id: String,
        definition: ServerDefinition,
        data_dir: PathBuf,
        store: Arc<dyn ConfigStore>,
        console: ConsoleBuffer,
    ) -> Arc<Self> {
        let launch = Arc::new(RwLock::new(definition.render_launch()));
        let environment = create_environment(
            definition.strategy,
            id.clone(),
            launch.clone(),
            data_dir.clone(),
            console,
        );
        Arc::new(Self {
            scheduler: Scheduler::new(id.clone()),
            id,
            definition: RwLock::new(definition),
            launch,
            environment,
            store,
            data_dir,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.environment
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    pub async fn definition(&self) -> ServerDefinition {
        self.definition.read().await.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn start(&self) -> Result<()> {
        self.environment.start().await.map_err(Into::into)
    }

    pub async fn stop(&self) -> Result<()> {
        self.environment.stop().await.map_err(Into::into)
    }

    pub async fn kill(&self) -> Result<()> {
        self.environment.kill().await.map_err(Into::into)
    }

    pub fn is_running(&self) -> bool {
        self.environment.is_running()
    }

    pub async fn get_stats(&self) -> Result<ProcessStats> {
        self.environment.get_stats().await.map_err(Into::into)
    }

    /// Run the configured install commands in the data directory, streaming
    /// their output into the console. Refused while the server runs.
    pub async fn install(&self) -> Result<()> {
        if self.is_running() {
            return Err(EnvError::AlreadyRunning.into());
        }
        let commands = self.definition.read().await.install.clone();
        let console = self.environment.console();

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(EnvError::Io)?;

        info!(server = %self.id, steps = commands.len(), "Installing server");
        for command in commands {
            console.write_line(&format!("[berth] install: {command}"));
            let output = tokio::process::Command::new("sh")
                .args(["-c", &command])
                .current_dir(&self.data_dir)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| ProgramError::InstallFailed(e.to_string()))?;

            console.write(&String::from_utf8_lossy(&output.stdout));
            console.write(&String::from_utf8_lossy(&output.stderr));
            console.flush();

            if !output.status.success() {
                return Err(ProgramError::InstallFailed(format!(
                    "command '{command}' exited with {}",
                    output.status
                )));
            }
        }
        console.write_line("[berth] install complete");
        Ok(())
    }

    // ========================================================================
    // Console
    // ========================================================================

    pub fn get_console_from(&self, epoch: i64) -> (Vec<String>, i64) {
        self.environment.get_console_from(epoch)
    }

    pub fn add_listener(&self, listener: Listener) {
        self.environment.add_listener(listener);
    }

    /// Write an operator command to the server console.
    pub async fn execute(&self, command: &str) -> Result<()> {
        self.environment.send_input(command).await.map_err(Into::into)
    }

    // ========================================================================
    // Variables
    // ========================================================================

    /// The variable set; non-admin callers only see user-editable entries.
    pub async fn get_data(&self, is_admin: bool) -> BTreeMap<String, Variable> {
        let definition = self.definition.read().await;
        definition
            .variables
            .iter()
            .filter(|(_, v)| is_admin || v.user_editable)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Update known variables and persist. Non-admin callers may only touch
    /// user-editable ones; unknown names are ignored.
    pub async fn edit_data(
        &self,
        values: HashMap<String, serde_json::Value>,
        is_admin: bool,
    ) -> Result<()> {
        {
            let mut definition = self.definition.write().await;
            for (name, value) in values {
                if let Some(variable) = definition.variables.get_mut(&name) {
                    if variable.user_editable || is_admin {
                        variable.value = value;
                    }
                }
            }
            *self.launch.write().await = definition.render_launch();
        }
        self.save().await
    }

    /// Replace the whole definition transactionally: if persisting fails, the
    /// prior in-memory definition is restored before the error returns.
    pub async fn edit_definition(&self, replacement: ServerDefinition) -> Result<()> {
        let backup = {
            let mut definition = self.definition.write().await;
            let backup = definition.clone();
            *definition = replacement;
            *self.launch.write().await = definition.render_launch();
            backup
        };

        if let Err(e) = self.save().await {
            warn!(server = %self.id, error = %e, "Save failed, reverting definition");
            let mut definition = self.definition.write().await;
            *self.launch.write().await = backup.render_launch();
            *definition = backup;
            return Err(e);
        }
        Ok(())
    }

    /// Swap in a freshly loaded definition without touching environment or
    /// scheduler identity.
    pub(crate) async fn replace_definition(&self, definition: ServerDefinition) {
        let mut guard = self.definition.write().await;
        *self.launch.write().await = definition.render_launch();
        *guard = definition;
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    pub async fn tasks(&self) -> HashMap<String, Task> {
        self.scheduler.tasks().await
    }

    pub async fn add_task(&self, task: Task) -> Result<()> {
        self.scheduler.add(task).await?;
        self.save().await
    }

    pub async fn remove_task(&self, name: &str) -> Result<()> {
        self.scheduler.remove(name).await?;
        self.save().await
    }

    /// Atomic task edit: the old trigger cannot fire once this returns, and
    /// there is no window with the task missing.
    pub async fn edit_task(&self, task: Task) -> Result<()> {
        self.scheduler.replace(task).await?;
        self.save().await
    }

    // ========================================================================
    // Files
    // ========================================================================

    pub async fn get_item(&self, path: &str) -> Result<FileRequest> {
        self.environment.sandbox().get_item(path).await.map_err(Into::into)
    }

    pub async fn open_file(&self, path: &str) -> Result<tokio::fs::File> {
        self.environment.sandbox().open_file(path).await.map_err(Into::into)
    }

    pub async fn create_folder(&self, path: &str) -> Result<()> {
        self.environment.sandbox().create_folder(path).await.map_err(Into::into)
    }

    pub async fn delete_item(&self, path: &str) -> Result<()> {
        self.environment.sandbox().delete_item(path).await.map_err(Into::into)
    }

    pub async fn archive_items(&self, files: &[String], destination: &str) -> Result<()> {
        self.environment
            .sandbox()
            .archive_items(files, destination)
            .await
            .map_err(Into::into)
    }

    pub async fn extract(&self, archive_path: &str, destination: &str) -> Result<()> {
        self.environment
            .sandbox()
            .extract(archive_path, destination)
            .await
            .map_err(Into::into)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Install the persisted task set and start the scheduler.
    ///
    /// Called once after construction; the scheduler holds only a weak
    /// reference back, so an activated program can still be dropped.
    pub async fn activate(self: &Arc<Self>, tasks: HashMap<String, Task>) -> Result<()> {
        self.scheduler.load_map(tasks).await?;
        let runner: Arc<dyn TaskRunner> = self.clone();
        self.scheduler.start(Arc::downgrade(&runner)).await?;
        Ok(())
    }

    /// Persist the current definition and task map.
    pub async fn save(&self) -> Result<()> {
        let snapshot = PersistedProgram {
            definition: self.definition.read().await.clone(),
            tasks: self.scheduler.tasks().await,
        };
        self.store.save(&self.id, &snapshot).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskRunner for Program {
    async fn run_task(&self, name: &str, action: &TaskAction) -> anyhow::Result<()> {
        info!(server = %self.id, task = %name, action = ?action, "Running scheduled task");
        match action {
            TaskAction::Start => self.start().await?,
            TaskAction::Stop => self.stop().await?,
            TaskAction::Restart => {
                // Already-stopped is a benign outcome here.
                match self.stop().await {
                    Ok(()) | Err(ProgramError::Env(EnvError::NotRunning)) => {}
                    Err(e) => return Err(e.into()),
                }
                if !self
                    .environment
                    .wait_for_main_process_for(RESTART_GRACE)
                    .await
                {
                    self.kill().await?;
                    self.environment.wait_for_main_process().await;
                }
                self.start().await?;
            }
            TaskAction::Command { command } => self.execute(command).await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(value: serde_json::Value, user_editable: bool) -> Variable {
        Variable {
            value,
            display: String::new(),
            user_editable,
            required: false,
        }
    }

    #[test]
    fn substitute_replaces_known_variables() {
        let mut variables = BTreeMap::new();
        variables.insert("port".to_string(), var(serde_json::json!(25565), true));
        variables.insert(
            "world".to_string(),
            var(serde_json::json!("overworld"), true),
        );

        assert_eq!(
            substitute("--port ${port} --world ${world}", &variables),
            "--port 25565 --world overworld"
        );
    }

    #[test]
    fn substitute_leaves_unknown_references() {
        let variables = BTreeMap::new();
        assert_eq!(substitute("run ${missing}", &variables), "run ${missing}");
        assert_eq!(substitute("dangling ${open", &variables), "dangling ${open");
    }

    #[test]
    fn render_launch_substitutes_command_and_args() {
        let mut definition = ServerDefinition {
            run: RunConfig {
                command: "${engine}".to_string(),
                args: vec!["--mem".to_string(), "${memory}M".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        definition
            .variables
            .insert("engine".to_string(), var(serde_json::json!("java"), false));
        definition
            .variables
            .insert("memory".to_string(), var(serde_json::json!(2048), true));

        let launch = definition.render_launch();
        assert_eq!(launch.command, "java");
        assert_eq!(launch.args, vec!["--mem", "2048M"]);
    }

    #[test]
    fn requirements_accept_current_host() {
        let requirements = Requirements {
            os: Some(std::env::consts::OS.to_string()),
            arch: Some(std::env::consts::ARCH.to_string()),
            binaries: vec!["sh".to_string()],
        };
        assert!(requirements.test().is_ok());
    }

    #[test]
    fn requirements_reject_missing_binary() {
        let requirements = Requirements {
            binaries: vec!["definitely-not-a-real-binary-name".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            requirements.test(),
            Err(ProgramError::InvalidInput(_))
        ));
    }
}
