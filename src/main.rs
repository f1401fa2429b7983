use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flowci_core::config::AppConfig;
use flowci_core::event::EventBus;
use flowci_core::traits::JobStore;
use flowci_core::types::JobFilter;
use flowci_dispatch::{CommandDispatcher, HttpTransport};
use flowci_engine::{CallbackRouter, JobEventLogger, JobOrchestrator};
use flowci_gateway::GatewayServer;
use flowci_store::{FilePipelines, SqliteStore};

#[derive(Parser)]
#[command(name = "flowci", version, about = "Callback-driven CI job engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "flowci.toml", env = "FLOWCI_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway (default)
    Serve,
    /// Show current configuration
    Config,
    /// List stored jobs
    Jobs {
        /// Only jobs of this flow
        #[arg(long)]
        flow: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("flowci=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Jobs { flow } => {
            let store = SqliteStore::open(&config.database_path())?;
            let filter = match flow {
                Some(name) => JobFilter::Flow(name),
                None => JobFilter::All,
            };
            let jobs = store.list_jobs(filter).await?;
            if jobs.is_empty() {
                println!("No jobs.");
            }
            for job in jobs {
                println!(
                    "{:<24} #{:<5} {:<16} {}  {}",
                    job.node_name,
                    job.number,
                    job.status,
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.id
                );
            }
        }
        Commands::Serve => serve(config).await?,
    }

    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::open(&config.database_path())?);
    let pipelines_dir = config.pipelines_dir();
    std::fs::create_dir_all(&pipelines_dir).ok();
    let pipelines = Arc::new(FilePipelines::new(pipelines_dir));
    let event_bus = Arc::new(EventBus::default());

    let transport = Arc::new(HttpTransport::new(config.http.timeout_secs)?);
    let dispatcher = CommandDispatcher::from_config(&config, transport);
    let orchestrator = Arc::new(JobOrchestrator::new(
        store,
        pipelines,
        dispatcher,
        event_bus.clone(),
        &config.engine,
    ));
    let callbacks = CallbackRouter::new(orchestrator.clone());

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down gateway...");
        cancel_clone.cancel();
    });

    let logger = config
        .log_dir()
        .map(|dir| JobEventLogger::new(dir).spawn(&event_bus, cancel.clone()));

    info!(
        domain = %config.domain,
        zone = %config.platform.zone,
        bind = %config.gateway.bind,
        "Starting flowci"
    );
    let server = GatewayServer::new(config.gateway.clone(), orchestrator, callbacks);
    server.run(cancel.clone()).await?;

    cancel.cancel();
    if let Some(handle) = logger {
        handle.await.ok();
    }
    Ok(())
}
