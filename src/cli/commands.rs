//! CLI commands: serve the orchestrator, validate templates, check config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use crate::artifact::ArtifactStore;
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::coordinator::{CoordinatorConfig, OrchestrationCoordinator};
use crate::events::EventBus;
use crate::hub::WorkerChannelHub;
use crate::monitor::ResourceMonitor;
use crate::pool::manager::PoolManager;
use crate::provider::cluster::ClusterProvider;
use crate::provider::docker::DockerProvider;
use crate::provider::mock::MockProvider;
use crate::provider::{validation, Provider, WorkerTemplate};
use crate::queue::JobQueue;
use crate::storage::{InMemoryJobRepository, InMemoryPoolRepository};

/// taskfleet: distributed job orchestration over ephemeral worker fleets.
#[derive(Debug, Parser)]
#[command(name = "taskfleet", version, about)]
pub struct Cli {
    /// Log level when RUST_LOG is not set.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator.
    Serve {
        /// Path to a YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a worker template file (YAML).
    ValidateTemplate {
        /// Path to the template file.
        file: PathBuf,
    },
    /// Load and validate a configuration file, then print it.
    ConfigCheck {
        /// Path to a YAML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve { config } => serve(config.as_deref()).await,
        Command::ValidateTemplate { file } => validate_template(&file),
        Command::ConfigCheck { config } => config_check(config.as_deref()),
    }
}

async fn serve(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(config_path).context("loading configuration")?;
    crate::metrics::init_metrics().context("initializing metrics")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

    if config.providers.docker {
        let provider = DockerProvider::connect("docker")
            .await
            .context("connecting to the container runtime")?;
        providers.insert("docker".to_string(), Arc::new(provider));
    }
    if let Some(cluster) = config.providers.cluster.clone() {
        let provider = ClusterProvider::connect("cluster", cluster)
            .await
            .context("connecting to the cluster manager")?;
        providers.insert("cluster".to_string(), Arc::new(provider));
    }
    if config.providers.mock {
        providers.insert(
            "mock".to_string(),
            Arc::new(MockProvider::with_default_capacity("mock")),
        );
    }
    for provider in providers.values() {
        let info = provider.info();
        info!(
            provider = %info.name,
            kind = ?info.kind,
            event_stream = info.capabilities.worker_event_stream,
            "Provider registered"
        );
    }

    let monitor = Arc::new(ResourceMonitor::new(
        providers.values().cloned().collect(),
        Duration::from_secs(config.probe_interval_seconds),
        Arc::clone(&clock),
    ));
    let pools = Arc::new(PoolManager::new(providers, Arc::clone(&clock)));
    let queue = Arc::new(JobQueue::new(config.queue.clone(), Arc::clone(&clock)));
    let store = Arc::new(ArtifactStore::new(&config.artifact_path));
    let events = EventBus::new();
    let jobs_repo = Arc::new(InMemoryJobRepository::new());
    let pools_repo = Arc::new(InMemoryPoolRepository::new());

    let hub = Arc::new(WorkerChannelHub::new(
        config.hub_config(),
        Arc::clone(&queue),
        Arc::clone(&pools),
        store,
        jobs_repo.clone(),
        events.clone(),
        Arc::clone(&clock),
    ));

    let coordinator = Arc::new(OrchestrationCoordinator::new(
        CoordinatorConfig {
            queue_poll_interval: Duration::from_secs(config.queue_poll_interval_seconds),
            autoscale_interval: Duration::from_secs(config.autoscale_interval_seconds),
            metrics_interval: Duration::from_secs(config.metrics_interval_seconds),
        },
        queue,
        pools,
        hub,
        monitor,
        events,
        jobs_repo,
        pools_repo,
        clock,
    ));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "Worker channel hub listening");

    coordinator.start(listener).await;
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    coordinator.stop().await;
    Ok(())
}

fn validate_template(file: &std::path::Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let template: WorkerTemplate =
        serde_yaml::from_str(&raw).context("parsing worker template")?;

    let issues = validation::validate_template(&template);
    if issues.is_empty() {
        println!("{}: OK", file.display());
        Ok(())
    } else {
        for issue in &issues {
            eprintln!("{}: {issue}", file.display());
        }
        anyhow::bail!("{} validation issue(s)", issues.len());
    }
}

fn config_check(config_path: Option<&std::path::Path>) -> anyhow::Result<()> {
    let config = OrchestratorConfig::load(config_path).context("loading configuration")?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}
