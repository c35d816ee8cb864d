//! Flock node CLI entry point.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "flock", version)]
#[command(about = "Multi-agent swarm control plane node")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (optional, defaults to ./flock.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start this node's HTTP/A2A server and scheduler (default)
    Serve {
        /// Overrides the configured node id
        #[arg(long)]
        node_id: Option<String>,
        /// Overrides the configured bind address
        #[arg(long)]
        bind: Option<String>,
        /// Overrides the configured base path (migration working directory)
        #[arg(long)]
        base_path: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve {
        node_id: None,
        bind: None,
        base_path: None,
    });

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        init_tracing(cli.debug);

        match command {
            Command::Serve { node_id, bind, base_path } => {
                let mut config = flock::config::NodeConfig::load(cli.config.as_deref())?;
                if let Some(node_id) = node_id {
                    config.node_id = node_id;
                }
                if let Some(bind) = bind {
                    config.bind = bind;
                }
                if let Some(base_path) = base_path {
                    config.base_path = base_path;
                }
                serve(config).await
            }
        }
    })
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .init();
}

async fn serve(config: flock::config::NodeConfig) -> anyhow::Result<()> {
    let bind: SocketAddr = config.bind.parse()?;
    let node_id = config.node_id.clone();

    tracing::info!(node_id = %node_id, %bind, "starting flock node");

    let node = flock::node::build(config).await?;
    let shutdown_rx = node.shutdown_rx();

    let http_state = std::sync::Arc::new(flock::http::HttpState {
        server: node.server.clone(),
        cards: node.cards.clone(),
        node_id: node_id.clone(),
        started_at: std::time::Instant::now(),
    });

    let http_handle = flock::http::serve(bind, http_state, shutdown_rx).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received ctrl-c, shutting down");
        }
        result = terminate_signal() => {
            if let Err(error) = result {
                tracing::warn!(%error, "failed to install signal handler");
            } else {
                tracing::info!("received termination signal, shutting down");
            }
        }
    }

    node.shutdown().await;
    let _ = http_handle.await;
    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() -> anyhow::Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    term.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> anyhow::Result<()> {
    std::future::pending().await
}
