//! # Tunnel Broker
//!
//! A reverse-tunnel relay that lets a private server with no inbound connectivity
//! receive HTTP requests and bidirectional event streams from a public endpoint.
//! Both sides connect *out* to a central broker and stay connected.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP caller                                                   private server
//!      │                                                                ▲
//!      ▼                                                                │
//! ┌──────────────┐  client_request  ┌────────┐  broker_request  ┌────────────────┐
//! │ Client Agent │ ───────────────► │ Broker │ ───────────────► │ Upstream Agent │
//! │              │ ◄─────────────── │        │ ◄─────────────── │                │
//! └──────────────┘  broker_response └────────┘ upstream_response└────────────────┘
//!      ▲  stream connections     (virtual connections)     peer connections │
//!      └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every hop mints its own request id and keeps its own deadline in a
//! [`registry::Registry`]; each pending entry ends exactly once, by reply, error or
//! timeout. Only the client agent's timeout reaches the original caller (HTTP 504).

pub mod agent;
pub mod broker;
pub mod config;
pub mod http;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod url_rewrite;

pub use config::Config;

use std::time::Duration;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request TTL used by the broker and the client agent
pub const DEFAULT_REQUEST_TTL: Duration = Duration::from_secs(10);

/// Request TTL used by the upstream agent
pub const DEFAULT_UPSTREAM_TTL: Duration = Duration::from_secs(30);

/// Largest HTTP body buffered for relay (8 MB)
pub const DEFAULT_MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

/// Default broker port
pub const DEFAULT_BROKER_PORT: u16 = 7900;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("URL rewrite error: {0}")]
    Rewrite(#[from] url_rewrite::RewriteError),

    #[error("HTTP error: {0}")]
    Http(#[from] http::HttpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}
