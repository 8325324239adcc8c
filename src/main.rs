use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use strata_agent::{AgentService, AgentSettings};
use strata_server::ServerSettings;
use strata_store::{InMemoryStore, Repository};

#[derive(Parser)]
#[command(name = "strata", version, about = "Distributed database backup orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane.
    Server {
        #[arg(short, long, default_value = "strata-server.json")]
        config: PathBuf,
    },
    /// Run an agent next to a database server.
    Agent {
        #[arg(short, long, default_value = "strata-agent.json")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Server { config } => run_server(config).await,
        Command::Agent { config } => run_agent(config).await,
    }
}

async fn run_server(path: PathBuf) -> anyhow::Result<()> {
    let settings = ServerSettings::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    strata_telemetry::init_telemetry(&settings.logging)?;

    let store = Arc::new(InMemoryStore::new());
    settings
        .catalogue
        .seed(store.as_ref())
        .context("seeding job catalogue")?;
    tracing::info!(
        agents = store.list_agents()?.len(),
        jobs = store.list_jobs()?.len(),
        "catalogue loaded"
    );

    let handle = strata_server::start(&settings, store).await?;
    tracing::info!(port = handle.port(), "strata control plane ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    handle.shutdown();
    Ok(())
}

async fn run_agent(path: PathBuf) -> anyhow::Result<()> {
    let settings = AgentSettings::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    strata_telemetry::init_telemetry(&settings.logging)?;

    let service = AgentService::from_settings(&settings).context("loading agent key")?;
    tracing::info!(agent_key = %settings.agent_key(), server = %settings.server_url, "strata agent starting");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            signal.cancel();
        }
    });

    service.run(shutdown).await;
    Ok(())
}
