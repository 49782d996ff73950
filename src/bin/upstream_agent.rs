//! Tunnel Upstream Agent
//!
//! Runs next to the private server:
//! - Connects out to the broker and registers under its name
//! - Executes relayed HTTP requests against the target address
//! - Optionally opens stream peer connections for tunneled streams

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tunnel_broker::{
    agent::{UpstreamAgent, UpstreamOptions},
    config::{Config, UpstreamConfig},
    http::HyperClient,
    url_rewrite::parse_target,
};

/// Tunnel Upstream Agent - executes relayed requests against a private server
#[derive(Parser, Debug)]
#[command(name = "tunnel-upstream-agent")]
#[command(about = "Tunnel Upstream Agent - serves relayed requests from a private server")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Agent id clients target (overrides config)
    #[arg(long)]
    id: Option<String>,

    /// Broker address (overrides config)
    #[arg(short, long)]
    broker: Option<String>,

    /// Base URL of the private server, e.g. http://127.0.0.1:3000 (overrides config)
    #[arg(short, long)]
    target_address: Option<String>,

    /// Address tunneled stream connections are opened to (overrides config)
    #[arg(long)]
    stream_peer: Option<String>,

    /// Request TTL in milliseconds (overrides config)
    #[arg(long)]
    ttl_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    // Initialize logging
    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, &config.logging.format);

    let mut upstream: UpstreamConfig = config.upstream.clone().unwrap_or_default();
    if let Some(id) = args.id {
        upstream.id = id;
    }
    if let Some(broker) = args.broker {
        upstream.broker = broker;
    }
    if let Some(target) = args.target_address {
        upstream.target_address = target;
    }
    if let Some(peer) = args.stream_peer {
        upstream.stream_peer = Some(peer);
    }
    if let Some(ttl_ms) = args.ttl_ms {
        upstream.request_ttl_ms = ttl_ms;
    }
    upstream.validate()?;

    let target = parse_target(&upstream.target_address).context("Invalid target address")?;
    let options = UpstreamOptions {
        id: upstream.id.clone(),
        target,
        request_ttl: upstream.request_ttl(),
        stream_peer: upstream.stream_peer.clone(),
    };
    let http = Arc::new(HyperClient::new(upstream.max_body_size));

    // Wait for shutdown signal
    tokio::select! {
        _ = UpstreamAgent::serve(options, upstream.broker.clone(), http) => {
            info!("Upstream agent stopped");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}

fn init_logging(level: &str, format: &str) {
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match format {
        "json" => builder.json().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}
