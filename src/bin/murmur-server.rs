use anyhow::Context;
use clap::Parser;
use murmur::{Cluster, Node, NodeConfig, NodeState};
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long to wait for each node to join before starting the next one.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct App {
    /// Number of nodes to run in this process.
    #[clap(long, default_value = "3")]
    nodes: u16,

    #[clap(long, default_value = "127.0.0.1")]
    addr: String,

    /// API port of the first node; node N listens on this port + N - 1.
    #[clap(long, default_value = "9000")]
    api_port: u16,

    /// Gossip port of the first node; node N listens on this port + N - 1.
    #[clap(long, default_value = "7900")]
    gossip_port: u16,

    /// Gossip address of an existing cluster for the first node to join.
    #[clap(long)]
    join: Option<String>,

    #[clap(long)]
    push_pull_interval_ms: Option<u64>,

    #[clap(long, default_value = "info", env = "MURMUR_LOG")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::parse();
    tracing_subscriber::fmt()
        .with_max_level(app.log_level)
        .init();

    anyhow::ensure!(app.nodes > 0, "at least one node is required");
    info!("murmur-server version: {}", env!("CARGO_PKG_VERSION"));

    // Installed before any node starts so an early SIGTERM still shuts down
    // cleanly.
    let shutdown = shutdown_signal();

    let mut cluster = Cluster::new();
    for i in 0..app.nodes {
        let api_port = app
            .api_port
            .checked_add(i)
            .context("api port range overflows")?;
        let gossip_port = app
            .gossip_port
            .checked_add(i)
            .context("gossip port range overflows")?;
        // Each node joins through the one started before it.
        let join = match i {
            0 => app.join.clone(),
            _ => Some(format!("{}:{}", app.addr, gossip_port - 1)),
        };

        let mut config = NodeConfig::new(
            format!("node{}", i + 1),
            app.addr.clone(),
            api_port,
            gossip_port,
            join,
        );
        if let Some(ms) = app.push_pull_interval_ms {
            config = config.with_push_pull_interval(Duration::from_millis(ms));
        }

        let node = Node::with_config(config);
        cluster.start(node.clone());

        match tokio::time::timeout(STARTUP_GRACE, node.wait_running()).await {
            Ok(NodeState::Running) => {}
            _ => warn!(node = %node.name(), "node not running yet, starting the next one anyway"),
        }
    }

    cluster.run_until(shutdown).await?;
    info!("all nodes shutdown... exiting now.");
    Ok(())
}

/// Install the signal handlers right away; the returned future completes on
/// Ctrl-C or SIGTERM.
fn shutdown_signal() -> impl Future<Output = ()> {
    #[cfg(unix)]
    let sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .map_err(|e| error!("Error installing SIGTERM handler: {e}"))
            .ok()
    };

    async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Error receiving Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            match sigterm {
                Some(mut sigterm) => {
                    sigterm.recv().await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received shutdown signal"),
            _ = terminate => info!("Received termination signal"),
        }
    }
}
