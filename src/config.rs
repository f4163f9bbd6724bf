//! Daemon configuration.
//!
//! Loaded from a YAML file with `${VAR}` environment expansion. A missing
//! file yields defaults; a malformed file surfaces an error. Relative paths
//! are resolved against the config file's directory so behavior does not
//! depend on the working directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;

/// Default workspace directory (relative to config file).
pub const DEFAULT_WORKSPACE: &str = ".berth";
/// Per-server data directories (relative to workspace).
pub const DEFAULT_SERVERS_DIR: &str = "servers";
/// Persisted server definitions (relative to workspace).
pub const DEFAULT_DEFINITIONS_DIR: &str = "definitions";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Default tracing filter when RUST_LOG is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_console_lines")]
    pub lines: usize,
    #[serde(default = "default_console_age_seconds")]
    pub max_age_seconds: u64,
}

#[derive(Debug, Deserialize)]
pub struct ShutdownConfig {
    /// Per-server grace period before a straggler is killed.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_yaml::from_str(&expanded)?)
    }

    pub fn workspace_path(&self, config_path: &Path) -> PathBuf {
        let workspace = self
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKSPACE));
        resolve_path(config_path, &workspace)
    }

    pub fn servers_path(&self, config_path: &Path) -> PathBuf {
        self.workspace_path(config_path).join(DEFAULT_SERVERS_DIR)
    }

    pub fn definitions_path(&self, config_path: &Path) -> PathBuf {
        self.workspace_path(config_path).join(DEFAULT_DEFINITIONS_DIR)
    }

    pub fn console_max_age(&self) -> Duration {
        Duration::from_secs(self.console.max_age_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown.grace_seconds)
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            lines: default_console_lines(),
            max_age_seconds: default_console_age_seconds(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_seconds: default_grace_seconds(),
        }
    }
}

/// Resolve a path relative to the config file directory.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let config_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    config_dir.join(path)
}

/// Replace `${VAR}` references with environment variable values.
fn expand_env_vars(contents: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(contents.len());
    let mut rest = contents;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(ConfigError::UnclosedVarReference)?;
        let name = &after[..end];
        let value =
            std::env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.to_string()))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn default_console_lines() -> usize {
    1000
}

fn default_console_age_seconds() -> u64 {
    600
}

fn default_grace_seconds() -> u64 {
    60
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_fields_missing() {
        let config: Config = serde_yaml::from_str("workspace: /srv/berth").unwrap();
        assert_eq!(config.console.lines, 1000);
        assert_eq!(config.shutdown.grace_seconds, 60);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn expand_replaces_set_variables() {
        std::env::set_var("BERTH_TEST_WORKSPACE", "/data");
        let expanded = expand_env_vars("workspace: ${BERTH_TEST_WORKSPACE}/berth").unwrap();
        assert_eq!(expanded, "workspace: /data/berth");
    }

    #[test]
    fn expand_rejects_missing_variable() {
        assert!(matches!(
            expand_env_vars("workspace: ${BERTH_TEST_UNSET_VAR}"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn expand_rejects_unclosed_reference() {
        assert!(matches!(
            expand_env_vars("workspace: ${OOPS"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let resolved = resolve_path(Path::new("/etc/berth/berth.yaml"), Path::new("data"));
        assert_eq!(resolved, PathBuf::from("/etc/berth/data"));

        let absolute = resolve_path(Path::new("/etc/berth/berth.yaml"), Path::new("/srv/data"));
        assert_eq!(absolute, PathBuf::from("/srv/data"));
    }
}
