mod config;
mod logging;
mod server;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use orca_core::bus::EventBus;
use orca_core::cleanup::start_cleanup_loop;
use orca_core::coordination::Coordination;
use orca_core::graph::DependencyGraph;
use orca_core::poller::{PollingFallback, SyncSource};
use orca_core::scheduler::Scheduler;
use orca_core::settings;
use orca_core::sync::Synchronizer;
use orca_core::tracker::{TrackerApi, TrackerClient};
use orca_core::worktree::WorktreeProvisioner;
use orca_db::pool::{create_pool, ensure_schema};

use config::{config_path, save_config, ConfigFile, OrcaConfig};

#[derive(Parser)]
#[command(name = "orca", about = "Supervisor that turns tracker tickets into coding-agent sessions")]
struct Cli {
    /// Store file path (overrides ORCA_STORE_PATH)
    #[arg(long, global = true)]
    store_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write an orca config file skeleton (no tracker access required)
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run the supervisor: scheduler, synchronizer, poller, and HTTP API
    Serve {
        /// Listen port (overrides the config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

fn main() {
    // Argument errors exit 1 (clap's default help/version paths stay 0).
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            std::process::exit(1);
        }
        Err(e) => {
            let _ = e.print();
            std::process::exit(0);
        }
    };

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    let result = runtime.block_on(run(cli));

    match result {
        Ok(()) => {}
        Err(e) => {
            error!(error = %e, "orca exited with error");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init { force } => init_command(force),
        Commands::Serve { port } => serve_command(cli.store_path.as_deref(), port).await,
    }
}

fn init_command(force: bool) -> Result<()> {
    let path = config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    save_config(&ConfigFile::default())?;
    println!("wrote config skeleton to {}", path.display());
    println!("fill in tracker.api_key, tracker.webhook_secret, and tracker.project_repos");
    Ok(())
}

async fn serve_command(store_path: Option<&str>, port: Option<u16>) -> Result<()> {
    let config = OrcaConfig::resolve(store_path, port)?;

    let _writer = logging::init_tracing(&config.log_path, config.log_max_size_bytes)?;
    info!(store = %config.store_path.display(), "starting orca");

    let pool = create_pool(&config.store_path).await?;
    ensure_schema(&pool).await.context("store bootstrap failed")?;

    let coordination = Arc::new(Coordination::new());
    let bus = EventBus::new();
    let graph = Arc::new(Mutex::new(DependencyGraph::new()));
    let shared_settings = settings::shared(config.settings.clone());

    let tracker: Arc<dyn TrackerApi> = Arc::new(TrackerClient::new(config.api_key.clone()));
    let sync = Arc::new(Synchronizer::new(
        pool.clone(),
        tracker,
        Arc::clone(&coordination),
        bus.clone(),
        graph,
        config.sync.clone(),
    ));

    let provisioner = WorktreeProvisioner::default();
    let project_root = config
        .store_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        Arc::clone(&shared_settings),
        Arc::clone(&coordination),
        provisioner.clone(),
        Arc::clone(&sync),
        bus.clone(),
        project_root,
    ));

    // Orphan recovery must finish before the first dispatch.
    scheduler.recover_orphans().await?;

    // Bootstrap sync: populates tasks, the dependency graph, and the
    // workflow-state map used by write-backs. Failures are not fatal; the
    // poller retries.
    match sync.full_sync().await {
        Ok(report) => info!(synced = report.synced, failed = report.failed, "initial sync"),
        Err(e) => warn!(error = %e, "initial sync failed"),
    }

    scheduler.start();

    // The tunnel supervisor is an external collaborator; without one the
    // webhook path is never reported healthy and polling stays active.
    let poller = Arc::new(PollingFallback::start(
        Arc::clone(&sync) as Arc<dyn SyncSource>,
        Arc::new(|| false),
    ));

    let cleanup_cancel = CancellationToken::new();
    start_cleanup_loop(
        pool.clone(),
        provisioner,
        Arc::clone(&shared_settings),
        cleanup_cancel.clone(),
    );

    let state = server::AppState {
        pool,
        coordination,
        sync,
        scheduler,
        bus,
        settings: shared_settings,
        poller,
        webhook_secret: config.webhook_secret.clone(),
        project_ids: Arc::new(config.sync.project_ids.iter().cloned().collect::<HashSet<_>>()),
        system_log_path: config.log_path.clone(),
    };

    let result = server::run_serve(state, &config.bind, config.port).await;
    cleanup_cancel.cancel();
    result
}
