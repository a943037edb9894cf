use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use ksi::daemon::{pid_guard, DaemonCore, KsiDaemon};
use ksi::DaemonConfig;

/// The ksi coordination daemon.
#[derive(Debug, Parser)]
#[command(name = "ksi-daemon", version, about)]
struct Cli {
    /// Unix socket path to serve on.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Start as a hot-reload successor: serve on --socket and expect a
    /// LOAD_STATE from the daemon at this path shortly after becoming
    /// healthy. Skips the collision guard.
    #[arg(long, value_name = "PRIMARY_SOCKET")]
    hot_reload_from: Option<PathBuf>,

    /// Optional configuration file (TOML/YAML/JSON).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(socket) = cli.socket {
        config.socket_path = socket;
    }
    config.ensure_directories()?;

    ksi::logging::init(&config.log_dir, &config.log_level)?;

    if let Some(predecessor) = &cli.hot_reload_from {
        tracing::info!(
            predecessor = %predecessor.display(),
            "starting in hot-reload successor mode"
        );
    } else {
        match pid_guard::check(&config).await? {
            pid_guard::CollisionOutcome::AlreadyRunning { pid } => {
                eprintln!("ksi-daemon already running (pid {pid}); nothing to do");
                return Ok(());
            }
            pid_guard::CollisionOutcome::Proceed => {}
        }
    }

    let core = DaemonCore::wire(config)?;
    let daemon = KsiDaemon::bind(core)?;
    daemon.run().await
}
