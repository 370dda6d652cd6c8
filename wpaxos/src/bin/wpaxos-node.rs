//! Run one Paxos node over TCP.
//!
//! # Usage
//!
//! Fresh start of node 0 of the cluster described in `inputs/nodeList.txt`:
//! ```bash
//! cargo run --bin wpaxos-node -- 0 inputs/nodeList.txt
//! ```
//!
//! Restart node 2 from its state file after a crash:
//! ```bash
//! cargo run --bin wpaxos-node -- 2 inputs/nodeList.txt states/node_2.state
//! ```
//!
//! A shorter demo with verbose logs:
//! ```bash
//! RUST_LOG=wpaxos=debug cargo run --bin wpaxos-node -- 0 inputs/nodeList.txt --rounds 3
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wpaxos::runtime::{AppConfig, RuntimeConfig, TcpRuntime, run_demo};
use wpaxos::{ClusterConfig, FileStateStore, NodeId};

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "wpaxos-node")]
#[command(about = "Weighted multi-round Paxos node", long_about = None)]
struct Args {
    /// Process id, the node's line index in the node list
    id: usize,

    /// Node list file (`ip port weight msg_delay unreliability dl dp` per line)
    node_list: PathBuf,

    /// State file to restart from; omit for a fresh start
    state_file: Option<PathBuf>,

    /// Number of rounds the distinguished proposer drives
    #[arg(long, default_value = "10")]
    rounds: usize,

    /// Pause between rounds, in milliseconds
    #[arg(long, default_value = "100")]
    round_interval_ms: u64,

    /// Wait before the first round, in milliseconds
    #[arg(long, default_value = "5000")]
    startup_delay_ms: u64,

    /// Directory for the state file on a fresh start
    #[arg(long, default_value = FileStateStore::DEFAULT_DIR)]
    state_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = ClusterConfig::from_file(&args.node_list)?;
    let id = NodeId::new(args.id);
    config.node(id)?;

    let restart = args.state_file.is_some();
    let store = match &args.state_file {
        Some(path) => FileStateStore::new(path),
        None => FileStateStore::for_node(&args.state_dir, id),
    };
    tracing::info!(
        node = %id,
        nodes = config.node_count(),
        state = %store.path().display(),
        restart,
        "starting paxos node"
    );

    let app = AppConfig {
        rounds: args.rounds,
        round_interval: Duration::from_millis(args.round_interval_ms),
        startup_delay: Duration::from_millis(args.startup_delay_ms),
        round_timeout: None,
    };

    let local = tokio::task::LocalSet::new();
    local
        .run_until(async move {
            let mut runtime = TcpRuntime::new(id, config, store, restart, RuntimeConfig::default())?;
            let listener = runtime.bind().await?;
            runtime.start(listener);

            let chosen = run_demo(&mut runtime, &app).await?;
            tracing::info!(node = %id, rounds = chosen.len(), "demo finished, serving until interrupted");

            tokio::signal::ctrl_c().await?;
            tracing::info!(node = %id, "shutting down");
            Ok::<_, Box<dyn std::error::Error>>(())
        })
        .await
}
