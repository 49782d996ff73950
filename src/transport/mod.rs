//! Transport layer
//!
//! A persistent, ordered, bidirectional channel of named events per connection.
//! Each connection is driven by its own task; the owning component sees it only
//! through a [`ConnectionHandle`] (outbound) and [`Inbound`] events on its inbox.
//!
//! Provides:
//! - Length-prefixed JSON framing of [`Envelope`]s
//! - TCP accept/connect
//! - Channel-backed handles for in-process use

mod frame;
mod tcp;

pub use frame::{check_frame_size, decode_frame, encode_frame, FRAME_HEADER_SIZE};
pub use tcp::{accept_loop, connect, dial, spawn_connection};

use crate::protocol::{Envelope, ProtocolError};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// Connection timeout for outbound connections
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of an inbox fed by connection tasks
pub const INBOX_CAPACITY: usize = 1024;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Event delivered from a connection to its owner
#[derive(Debug)]
pub enum TransportEvent {
    /// A new inbound connection was accepted
    Connected(ConnectionHandle),
    /// A named event arrived
    Message(Envelope),
    /// The connection is gone; delivered exactly once, always last
    Disconnect,
}

/// An event tagged with the connection it came from
#[derive(Debug)]
pub struct Inbound {
    pub conn: ConnectionId,
    pub event: TransportEvent,
}

/// Instruction from a handle to its connection task
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Emit(Envelope),
    Disconnect,
}

/// Sending half of a connection.
///
/// Emitting never blocks. Anything sent after the connection closed is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self { id, tx }
    }

    /// Create a handle whose outgoing traffic lands on a plain channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(ConnectionId::next(), tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event for the peer
    pub fn emit(&self, envelope: impl Into<Envelope>) {
        let envelope = envelope.into();
        if self.tx.send(Outgoing::Emit(envelope)).is_err() {
            trace!("{} closed, dropping outgoing event", self.id);
        }
    }

    /// Ask the connection to close
    pub fn disconnect(&self) {
        let _ = self.tx.send(Outgoing::Disconnect);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
