//! Tunnel Broker
//!
//! The central relay both agents connect out to:
//! - Registers client and upstream agents by name
//! - Routes relayed HTTP requests to upstream agents and replies back
//! - Pairs and forwards tunneled stream connections

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tunnel_broker::{
    broker::{Broker, BrokerOptions},
    config::{generate_example_config, BrokerConfig, Config},
};

/// Tunnel Broker - relays requests between client and upstream agents
#[derive(Parser, Debug)]
#[command(name = "tunnel-broker")]
#[command(about = "Tunnel Broker - relays HTTP requests and streams between agents")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    generate_config: Option<String>,

    /// Broker id (overrides config)
    #[arg(long)]
    id: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Listen port on all interfaces (overrides config and --listen)
    #[arg(short, long)]
    port: Option<u16>,

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

    if let Some(path) = &args.generate_config {
        generate_example_config()
            .save(path)
            .context("Failed to write example configuration")?;
        info!("Wrote example configuration to {}", path);
        return Ok(());
    }

    let mut broker_config: BrokerConfig = config.broker.clone().unwrap_or_default();
    if let Some(id) = args.id {
        broker_config.id = id;
    }
    if let Some(listen) = args.listen {
        broker_config.listen = listen;
    }
    if let Some(port) = args.port {
        broker_config.listen = format!("0.0.0.0:{}", port);
    }
    if let Some(ttl_ms) = args.ttl_ms {
        broker_config.request_ttl_ms = ttl_ms;
    }
    broker_config.validate()?;

    let listener = TcpListener::bind(&broker_config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", broker_config.listen))?;

    let broker = Broker::new(BrokerOptions {
        id: broker_config.id.clone(),
        request_ttl: broker_config.request_ttl(),
    });

    // Wait for shutdown signal
    tokio::select! {
        res = broker.serve(listener) => {
            res.context("Broker stopped")?;
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
