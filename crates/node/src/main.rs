//! LEO consensus node
//!
//! Starts the peer transport, registers the configured peers and drives
//! consensus rounds. A synthetic collaborator stands in for the reasoning
//! layer: it supplies a deterministic target vector derived from the node id
//! and a fixed semantic score, and prints each round's formatted result.

use anyhow::Result;
use clap::Parser;
use leo_consensus::{ConsensusNode, NodeConfig, RoundOutcome};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

/// LEO decentralized consensus node
#[derive(Parser, Debug)]
#[command(name = "leo-node")]
#[command(about = "Decentralized ADMM consensus with micro-attestations", long_about = None)]
struct Args {
    /// JSON config file (flags override its values)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Node identity
    #[arg(long)]
    node_id: Option<String>,

    /// Listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Peer as host:port (repeatable)
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// State vector length
    #[arg(long)]
    dimension: Option<usize>,

    /// ADMM penalty
    #[arg(long)]
    rho: Option<f64>,

    /// Trust weight for the local target
    #[arg(long)]
    alpha: Option<f64>,

    /// Semantic acceptance threshold
    #[arg(long)]
    tau: Option<f64>,

    /// Correctness tolerance
    #[arg(long)]
    delta_c: Option<f64>,

    /// Noise bound
    #[arg(long)]
    delta_n: Option<f64>,

    /// Collection window per round
    #[arg(long)]
    round_timeout_ms: Option<u64>,

    /// Round limit when converging
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Residual threshold
    #[arg(long)]
    epsilon: Option<f64>,

    /// Number of rounds to run (0 = run until converged)
    #[arg(long, default_value = "1")]
    rounds: u64,

    /// Semantic score the synthetic collaborator reports
    #[arg(long, default_value = "0.95")]
    semantic_score: f64,

    /// Wait before the first round so peers can come up
    #[arg(long, default_value = "1000")]
    startup_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> config::Overrides {
        config::Overrides {
            node_id: self.node_id.clone(),
            listen_addr: self.listen,
            dimension: self.dimension,
            rho: self.rho,
            alpha: self.alpha,
            tau: self.tau,
            delta_c: self.delta_c,
            delta_n: self.delta_n,
            round_timeout_ms: self.round_timeout_ms,
            max_iterations: self.max_iterations,
            epsilon: self.epsilon,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let base = config::load(args.config.as_deref())?;
    let config = config::resolve(base, args.overrides())?;

    run(args, config).await
}

async fn run(args: Args, config: NodeConfig) -> Result<()> {
    tracing::info!("Starting LEO consensus node {}", config.node_id);
    tracing::info!("  Listen: {}", config.listen_addr);
    tracing::info!("  Dimension: {}", config.dimension);
    tracing::info!("  rho={} alpha={} tau={}", config.rho, config.alpha, config.tau);

    let target = synthetic_target(&config.node_id, config.dimension);
    let mut node = ConsensusNode::new(config)?;

    // Bind failure is fatal
    node.start().await?;

    for spec in &args.peers {
        let (host, port) = config::parse_peer(spec)?;
        if let Err(e) = node.connect_to_peer(&host, port).await {
            tracing::warn!("Skipping peer {}: {}", spec, e);
        }
    }

    tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;

    tokio::select! {
        result = drive(&mut node, &target, args.rounds, args.semantic_score) => {
            if let Err(e) = result {
                tracing::error!("Consensus error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
        }
    }

    node.stop().await;

    let stats = node.stats();
    tracing::info!(
        "Node stopped after {} rounds ({} peer updates accepted, {} rejected)",
        stats.rounds_completed,
        stats.updates_accepted,
        stats.fragments_rejected
    );

    Ok(())
}

async fn drive(
    node: &mut ConsensusNode,
    target: &[f64],
    rounds: u64,
    semantic_score: f64,
) -> leo_consensus::Result<()> {
    if rounds == 0 {
        let outcome = node.run_until_converged(target, semantic_score).await?;
        report(&outcome);
        return Ok(());
    }
    for _ in 0..rounds {
        let outcome = node.run_round(target, semantic_score).await?;
        report(&outcome);
    }
    Ok(())
}

/// Hand the round result to the collaborator
fn report(outcome: &RoundOutcome) {
    println!("{}", outcome);
}

/// Deterministic per-node target in `[0, 1)`
fn synthetic_target(node_id: &str, dimension: usize) -> Vec<f64> {
    let seed = node_id
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ b as u64).wrapping_mul(0x0100_0000_01b3));
    let mut rng = StdRng::seed_from_u64(seed);
    (0..dimension).map(|_| rng.gen::<f64>()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_target_is_deterministic() {
        let a = synthetic_target("node-a", 16);
        assert_eq!(a, synthetic_target("node-a", 16));
        assert_ne!(a, synthetic_target("node-b", 16));
        assert!(a.iter().all(|x| (0.0..1.0).contains(x)));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "leo-node",
            "--node-id",
            "n1",
            "--listen",
            "127.0.0.1:5001",
            "--peer",
            "127.0.0.1:5002",
            "--peer",
            "127.0.0.1:5003",
            "--rounds",
            "3",
        ]);
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.rounds, 3);
        let overrides = args.overrides();
        assert_eq!(overrides.node_id.as_deref(), Some("n1"));
        assert_eq!(overrides.listen_addr, Some("127.0.0.1:5001".parse().unwrap()));
        assert!(overrides.dimension.is_none());
    }
}
