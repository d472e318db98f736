//! Main binary for the gossip membership daemon (gossipd)

use anyhow::{Context, Result};
use clap::Parser;
use gossip::{GossipConfig, GossipNode, PeerAddr};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gossipd")]
#[command(about = "Gossip-based membership and failure detection daemon")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Node address to listen on, host[:port]
    #[arg(long, value_name = "ADDR", default_value = ":8000")]
    address: String,

    /// Comma-separated seed hosts
    #[arg(long, value_name = "HOSTS", default_value = "")]
    seeds: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize logging; `RUST_LOG` overrides the default `info` level
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = GossipConfig::default();

    let listen = PeerAddr::parse_listen(&cli.address, config.default_port)
        .with_context(|| format!("invalid --address '{}'", cli.address))?;
    let seeds = parse_seeds(&cli.seeds, config.default_port)?;

    let node = GossipNode::bind(config, listen, seeds)
        .await
        .context("failed to start gossip node")?;

    info!("Listening on {}", node.socket_addr());
    match host_name() {
        Ok(name) => info!("hostname: {}", name),
        Err(e) => warn!("Cannot read host name: {}", e),
    }

    // The worker only returns if it panics
    node.spawn().await.context("gossip worker terminated")?;

    Ok(())
}

/// Host name from the OS rather than the shell environment
fn host_name() -> std::io::Result<String> {
    hostname::get().map(|name| name.to_string_lossy().into_owned())
}

/// Split the `--seeds` list; blank items are ignored
fn parse_seeds(input: &str, default_port: u16) -> Result<Vec<PeerAddr>> {
    input
        .split(',')
        .map(str::trim)
        .filter(|seed| !seed.is_empty())
        .map(|seed| {
            PeerAddr::parse(seed, default_port).with_context(|| format!("invalid seed '{}'", seed))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let cli = Cli::parse_from(["gossipd"]);
        assert_eq!(cli.address, ":8000");
        assert_eq!(cli.seeds, "");
    }

    #[test]
    fn test_parse_seeds() {
        assert!(parse_seeds("", 8000).unwrap().is_empty());

        let seeds = parse_seeds("node1, node2:9000,,10.0.0.3", 8000).unwrap();
        let seeds: Vec<&str> = seeds.iter().map(PeerAddr::as_str).collect();
        assert_eq!(seeds, vec!["node1:8000", "node2:9000", "10.0.0.3:8000"]);

        assert!(parse_seeds("node1,node2:http", 8000).is_err());
    }

    #[test]
    fn test_host_name_comes_from_os() {
        std::env::remove_var("HOSTNAME");
        assert!(!host_name().unwrap().is_empty());
    }

    #[test]
    fn test_cli_flags() {
        let cli = Cli::parse_from(["gossipd", "--address", "node1", "--seeds", "node2,node3"]);
        assert_eq!(cli.address, "node1");
        assert_eq!(parse_seeds(&cli.seeds, 8000).unwrap().len(), 2);
    }
}
