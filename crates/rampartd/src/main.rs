//! rampartd — the Rampart daemon.
//!
//! Single binary that assembles the release engine:
//! - State store (redb)
//! - Readiness gate and policy evaluator
//! - Health monitor
//! - Pipeline scheduler and rollback engine
//! - REST API
//!
//! # Usage
//!
//! ```text
//! rampartd init --data-dir /var/lib/rampart > rampart.toml
//! rampartd --config rampart.toml standalone
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rampart_core::{Clock, RampartConfig};
use rampart_health::StaticMetricsSource;
use rampart_rollout::{Collaborators, InMemoryRouter, LogNotifier, ReleaseOrchestrator};
use rampart_state::StateStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,rampartd=debug,rampart=debug";

#[derive(Parser)]
#[command(name = "rampartd", about = "Rampart release orchestration daemon")]
struct Cli {
    /// Path to rampart.toml. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine and API in one process.
    Standalone {
        /// Overrides `server.port`.
        #[arg(long)]
        port: Option<u16>,

        /// Overrides `server.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Print a default rampart.toml, or write it to `--output`.
    Init {
        #[arg(long, default_value = "/var/lib/rampart")]
        data_dir: PathBuf,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RampartConfig> {
    match path {
        Some(path) => {
            let config = RampartConfig::from_file(path)?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => {
            info!("no --config given, using defaults");
            Ok(RampartConfig::default())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Init { data_dir, output } => {
            let rendered = RampartConfig::scaffold(&data_dir).to_toml_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, rendered)?;
                    info!(path = %path.display(), "configuration written");
                }
                None => print!("{rendered}"),
            }
            Ok(())
        }
        Command::Standalone { port, data_dir } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            run_standalone(config).await
        }
    }
}

async fn run_standalone(config: RampartConfig) -> anyhow::Result<()> {
    info!("Rampart daemon starting in standalone mode");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("rampart.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let clock = Clock::new();
    let collaborators = Collaborators::new(
        Arc::new(InMemoryRouter::new()),
        Arc::new(StaticMetricsSource::new(clock)),
        Arc::new(LogNotifier),
    );
    let orchestrator = Arc::new(ReleaseOrchestrator::new(&config, store, collaborators, clock)?);
    info!("release orchestrator initialized");

    let resumed = orchestrator.recover().await?;
    if resumed > 0 {
        warn!(count = resumed, "resumed releases interrupted by a previous shutdown");
    }

    // ── Start API server ───────────────────────────────────────

    let router = rampart_api::build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    orchestrator.shutdown().await;
    info!("Rampart daemon stopped");
    Ok(())
}
