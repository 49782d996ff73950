//! Tunnel Client Agent
//!
//! Public entry point of the tunnel:
//! - Accepts HTTP requests and relays them through the broker
//! - Answers 504 when no reply arrives in time
//! - Optionally tunnels stream connections to the upstream side

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tunnel_broker::{
    agent::{ClientAgent, ClientOptions},
    config::{ClientConfig, Config},
};

/// Tunnel Client Agent - public HTTP endpoint of the tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnel-client-agent")]
#[command(about = "Tunnel Client Agent - relays inbound HTTP requests through the broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Agent id (overrides config)
    #[arg(long)]
    id: Option<String>,

    /// HTTP listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// HTTP listen port on all interfaces (overrides config and --listen)
    #[arg(short, long)]
    port: Option<u16>,

    /// Broker address (overrides config)
    #[arg(short, long)]
    broker: Option<String>,

    /// Upstream agent to route requests to (overrides config)
    #[arg(short, long)]
    upstream_target: Option<String>,

    /// Listen address for tunneled stream connections (overrides config)
    #[arg(long)]
    stream_listen: Option<String>,

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

    let mut client: ClientConfig = config.client.clone().unwrap_or_default();
    if let Some(id) = args.id {
        client.id = id;
    }
    if let Some(listen) = args.listen {
        client.listen = listen;
    }
    if let Some(port) = args.port {
        client.listen = format!("0.0.0.0:{}", port);
    }
    if let Some(broker) = args.broker {
        client.broker = broker;
    }
    if let Some(target) = args.upstream_target {
        client.upstream_target = target;
    }
    if let Some(stream_listen) = args.stream_listen {
        client.stream_listen = Some(stream_listen);
    }
    if let Some(ttl_ms) = args.ttl_ms {
        client.request_ttl_ms = ttl_ms;
    }
    client.validate()?;

    let http = TcpListener::bind(&client.listen)
        .await
        .with_context(|| format!("Failed to bind {}", client.listen))?;
    let streams = match &client.stream_listen {
        Some(addr) => Some(
            TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {}", addr))?,
        ),
        None => None,
    };

    let options = ClientOptions {
        id: client.id.clone(),
        upstream_target: client.upstream_target.clone(),
        request_ttl: client.request_ttl(),
    };

    // Wait for shutdown signal
    tokio::select! {
        res = ClientAgent::serve(options, client.broker.clone(), http, streams, client.max_body_size) => {
            res.context("Client agent stopped")?;
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
