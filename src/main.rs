use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use berth::config::Config;
use berth::registry::{Registry, RegistrySettings};
use berth::store::FileConfigStore;

/// berthd - supervises fleets of long-running game server processes
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "berth.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { config } => run(config).await,
    }
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path).await?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .init();

    let store = Arc::new(FileConfigStore::new(config.definitions_path(&config_path)));
    let mut settings = RegistrySettings::new(config.servers_path(&config_path));
    settings.console_lines = config.console.lines;
    settings.console_age = config.console_max_age();
    let registry = Arc::new(Registry::new(store, settings));

    registry.load_all().await?;
    info!("berthd running");

    wait_for_shutdown_signal().await;

    info!("Shutting down");
    registry.shutdown_service();
    registry.stop_all(config.shutdown_grace()).await;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
