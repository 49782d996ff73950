//! Protocol definitions and constants
//!
//! Every event on the wire is an [`Envelope`]: a name plus an ordered list of JSON
//! arguments. Tunnel connections between agents and the broker decode envelopes
//! into typed [`Message`]s; multiplexed stream connections forward them untouched.

mod message;

pub use message::{
    BrokerError, BrokerRequest, BrokerRequestAck, ClientRequest, ClientRequestAck, Headers,
    HeaderValue, Message, RelayError, StreamConnect, StreamDisconnect, StreamMessage,
    UpstreamError, UpstreamResponse,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid role: {0}")]
    InvalidRole(String),

    #[error("Missing argument {index} for event {event}")]
    MissingArgument { event: &'static str, index: usize },

    #[error("Malformed payload for event {event}: {source}")]
    MalformedPayload {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

/// Event names
pub mod events {
    pub const REGISTER: &str = "register";
    pub const CLIENT_REQUEST: &str = "client_request";
    pub const CLIENT_REQUEST_ACK: &str = "client_request_ack";
    pub const BROKER_REQUEST: &str = "broker_request";
    pub const BROKER_REQUEST_ACK: &str = "broker_request_ack";
    pub const UPSTREAM_RESPONSE: &str = "upstream_response";
    pub const UPSTREAM_ERROR: &str = "upstream_error";
    pub const BROKER_RESPONSE: &str = "broker_response";
    pub const BROKER_ERROR: &str = "broker_error";
    pub const CLIENT_SIO_CONNECTION: &str = "client_sio_connection";
    pub const CLIENT_SIO_MESSAGE: &str = "client_sio_message";
    pub const CLIENT_SIO_DISCONNECTION: &str = "client_sio_disconnection";
    pub const UPSTREAM_SIO_MESSAGE: &str = "upstream_sio_message";
    pub const UPSTREAM_SIO_DISCONNECT: &str = "upstream_sio_disconnect";
}

/// Maximum encoded frame size (32 MB)
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// A named event with an ordered argument list.
///
/// The relay never inspects `args` of envelopes it forwards for the multiplexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

impl Envelope {
    pub fn new(event: impl Into<String>, args: Vec<serde_json::Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }
}

/// Role an agent registers under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Upstream,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "upstream" => Ok(Role::Upstream),
            other => Err(ProtocolError::InvalidRole(other.to_string())),
        }
    }
}

/// Milliseconds since the Unix epoch, used for absolute TTL deadlines on the wire.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
