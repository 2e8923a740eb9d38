use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cybernetic::config::AppConfig;
use cybernetic::graph::{Metadata, ReplicaState};
use cybernetic::sync::LocalCluster;
use cybernetic::NodeRuntime;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "cybernetic-node", version, about = "Replicated graph and triple store node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single node until interrupted
    Run {
        /// Path to a TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the configured replica id
        #[arg(long)]
        replica_id: Option<String>,
    },
    /// Run an in-process cluster and report whether it converges
    Simulate {
        #[arg(short, long, default_value_t = 3)]
        nodes: usize,

        /// Sync intervals to wait after the writes
        #[arg(short, long, default_value_t = 5)]
        ticks: u32,

        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Serialize)]
struct SimulationReport {
    converged: bool,
    replicas: Vec<ReplicaState>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).compact().init();

    match Cli::parse().command {
        Command::Run { config, replica_id } => {
            let mut config = AppConfig::load(config.as_deref()).context("loading configuration")?;
            if let Some(id) = replica_id {
                config.node.replica_id = Some(id);
            }
            run(config).await
        }
        Command::Simulate {
            nodes,
            ticks,
            config,
        } => {
            let config = AppConfig::load(config.as_deref()).context("loading configuration")?;
            simulate(config, nodes.max(1), ticks).await
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let node = NodeRuntime::standalone(&config).await;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        replica = node.replica_id(),
        "cybernetic node running (single node)"
    );

    let mut report = tokio::time::interval(Duration::from_millis(
        config.graph.sync_interval_ms.max(1) * 10,
    ));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => match node.status().await {
                Ok(status) => info!(
                    sync_state = ?status.sync.state,
                    nodes = status.graph.nodes,
                    edges = status.graph.edges,
                    triples = status.graph.triples,
                    neighbors = status.graph.neighbors,
                    cache_entries = status.cache.active_entries,
                    "status"
                ),
                Err(err) => warn!("Status unavailable: {:#}", err),
            },
        }
    }

    info!("Shutting down");
    node.shutdown().await;
    Ok(())
}

async fn simulate(config: AppConfig, count: usize, ticks: u32) -> Result<()> {
    let cluster = LocalCluster::new();
    let mut nodes = Vec::with_capacity(count);
    for i in 0..count {
        nodes.push(NodeRuntime::join_local(&cluster, format!("node-{}", i), &config).await);
    }

    let settle = Duration::from_millis(
        config
            .cluster
            .settle_delay_ms
            .max(config.cluster.rejoin_delay_ms),
    );
    tokio::time::sleep(settle).await;

    for node in &nodes {
        node.put_triple(node.replica_id(), "member_of", "cluster", Metadata::new())
            .await?;
    }

    let interval = Duration::from_millis(config.graph.sync_interval_ms.max(1));
    tokio::time::sleep(interval * ticks.max(1)).await;

    let mut replicas = Vec::with_capacity(count);
    for node in &nodes {
        let state = node
            .graph()
            .get_state()
            .await
            .with_context(|| format!("reading state of {}", node.replica_id()))?;
        replicas.push(state);
    }
    let converged = replicas.windows(2).all(|pair| pair[0].graph == pair[1].graph);

    let report = SimulationReport {
        converged,
        replicas,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    for node in &nodes {
        node.shutdown().await;
    }
    Ok(())
}
