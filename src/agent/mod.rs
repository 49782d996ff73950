//! Agents and their link to the broker
//!
//! Each agent keeps exactly one outbound connection to the broker. The
//! [`BrokerLink`] owns that connection: it dials, registers under the agent's role
//! and id, and redials with exponential backoff whenever the connection drops.

pub mod client;
pub mod upstream;

pub use client::{ClientAgent, ClientOptions};
pub use upstream::{UpstreamAgent, UpstreamOptions};

use crate::protocol::{Envelope, Message, Role};
use crate::transport::{
    dial, spawn_connection, ConnectionHandle, ConnectionId, Inbound, TransportError,
    CONNECT_TIMEOUT,
};
use std::future::pending;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// First reconnect delay
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Where and how to redial the broker
struct Dialer {
    addr: String,
    inbox: mpsc::Sender<Inbound>,
}

/// An agent's registered connection to the broker
pub struct BrokerLink {
    role: Role,
    id: String,
    dialer: Option<Dialer>,
    handle: Option<ConnectionHandle>,
    pending: Option<JoinHandle<Result<TcpStream, TransportError>>>,
    initial_backoff: Duration,
    backoff: Duration,
    max_backoff: Duration,
}

impl BrokerLink {
    /// Start dialing the broker at `addr`. Events from the broker arrive on `inbox`.
    pub fn connect(
        role: Role,
        id: impl Into<String>,
        addr: impl Into<String>,
        inbox: mpsc::Sender<Inbound>,
    ) -> Self {
        let mut link = Self {
            role,
            id: id.into(),
            dialer: Some(Dialer {
                addr: addr.into(),
                inbox,
            }),
            handle: None,
            pending: None,
            initial_backoff: INITIAL_BACKOFF,
            backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        };
        link.schedule(Duration::ZERO);
        link
    }

    /// Use an already established connection; nothing is redialed if it drops.
    pub fn attached(role: Role, id: impl Into<String>, handle: ConnectionHandle) -> Self {
        let mut link = Self {
            role,
            id: id.into(),
            dialer: None,
            handle: None,
            pending: None,
            initial_backoff: INITIAL_BACKOFF,
            backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
        };
        link.register(handle);
        link
    }

    /// Override the reconnect delays
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether `conn` is the live broker connection
    pub fn is_current(&self, conn: ConnectionId) -> bool {
        self.handle.as_ref().map(|h| h.id()) == Some(conn)
    }

    /// Send a message to the broker; dropped while disconnected
    pub fn emit(&self, message: impl Into<Envelope>) -> bool {
        let envelope = message.into();
        match &self.handle {
            Some(handle) => {
                handle.emit(envelope);
                true
            }
            None => {
                debug!("Broker link down, dropping {}", envelope.event);
                false
            }
        }
    }

    /// Wait for the dial in progress. Pends forever when nothing is being dialed.
    pub async fn dialed(&mut self) -> Result<TcpStream, TransportError> {
        let Some(task) = self.pending.as_mut() else {
            return pending().await;
        };
        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
        };
        self.pending = None;
        result
    }

    /// Finish a dial: register on success, schedule the next attempt on failure
    pub fn on_dialed(&mut self, result: Result<TcpStream, TransportError>) {
        let Some(dialer) = &self.dialer else {
            return;
        };
        match result {
            Ok(stream) => {
                let handle = spawn_connection(stream, dialer.inbox.clone());
                info!("Connected to broker at {}", dialer.addr);
                self.backoff = self.initial_backoff;
                self.register(handle);
            }
            Err(e) => {
                warn!(
                    "Failed to reach broker at {}: {} (retrying in {:?})",
                    dialer.addr, e, self.backoff
                );
                let delay = self.backoff;
                self.backoff = next_backoff(self.backoff, self.max_backoff);
                self.schedule(delay);
            }
        }
    }

    /// Handle the loss of connection `conn`. Returns true if it was the live link.
    pub fn on_disconnect(&mut self, conn: ConnectionId) -> bool {
        if !self.is_current(conn) {
            return false;
        }
        self.handle = None;
        warn!("Lost connection to broker");
        if self.dialer.is_some() {
            let delay = self.backoff;
            self.backoff = next_backoff(self.backoff, self.max_backoff);
            self.schedule(delay);
        }
        true
    }

    fn register(&mut self, handle: ConnectionHandle) {
        handle.emit(Message::Register {
            role: self.role.as_str().to_string(),
            id: self.id.clone(),
        });
        info!("Registering as {} \"{}\"", self.role, self.id);
        self.handle = Some(handle);
    }

    fn schedule(&mut self, delay: Duration) {
        let Some(dialer) = &self.dialer else {
            return;
        };
        if let Some(previous) = self.pending.take() {
            previous.abort();
        }
        let addr = dialer.addr.clone();
        self.pending = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            dial(&addr, CONNECT_TIMEOUT).await
        }));
    }
}

impl Drop for BrokerLink {
    fn drop(&mut self) {
        if let Some(task) = self.pending.take() {
            task.abort();
        }
        if let Some(handle) = self.handle.take() {
            handle.disconnect();
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{decode_frame, TransportEvent};
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut buf = BytesMut::new();
        loop {
            if let Some(envelope) = decode_frame(&mut buf).unwrap() {
                return Message::from_envelope(envelope).unwrap();
            }
            let n = stream.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed before a full frame");
        }
    }

    fn register(id: &str) -> Message {
        Message::Register {
            role: "client".into(),
            id: id.into(),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let max = Duration::from_secs(30);
        let mut delay = INITIAL_BACKOFF;
        let mut seen = vec![];
        for _ in 0..7 {
            seen.push(delay.as_secs());
            delay = next_backoff(delay, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_attached_link_registers_immediately() {
        let (handle, mut rx) = ConnectionHandle::channel();
        let conn = handle.id();
        let mut link = BrokerLink::attached(Role::Upstream, "upstream123", handle);

        match rx.try_recv().unwrap() {
            crate::transport::Outgoing::Emit(env) => assert_eq!(
                env,
                Envelope::from(Message::Register {
                    role: "upstream".into(),
                    id: "upstream123".into()
                })
            ),
            other => panic!("expected register, got {:?}", other),
        }

        assert!(link.is_current(conn));
        assert!(link.on_disconnect(conn));
        assert!(!link.is_connected());
        assert!(!link.emit(register("x")));
    }

    #[tokio::test]
    async fn test_reconnects_and_registers_again() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(16);

        let mut link = BrokerLink::connect(Role::Client, "client123", addr, tx)
            .with_backoff(Duration::from_millis(10), Duration::from_millis(40));
        let dialed = link.dialed().await;
        link.on_dialed(dialed);
        assert!(link.is_connected());

        let (mut broker_side, _) = listener.accept().await.unwrap();
        assert_eq!(read_message(&mut broker_side).await, register("client123"));

        drop(broker_side);
        let inbound = rx.recv().await.unwrap();
        assert!(matches!(inbound.event, TransportEvent::Disconnect));
        assert!(link.on_disconnect(inbound.conn));
        assert!(!link.on_disconnect(inbound.conn), "a stale disconnect is ignored");

        let dialed = link.dialed().await;
        link.on_dialed(dialed);
        let (mut broker_side, _) = listener.accept().await.unwrap();
        assert_eq!(read_message(&mut broker_side).await, register("client123"));
    }

    #[tokio::test]
    async fn test_failed_dial_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (tx, _rx) = mpsc::channel(16);

        let mut link = BrokerLink::connect(Role::Client, "client123", addr.clone(), tx)
            .with_backoff(Duration::from_millis(50), Duration::from_millis(100));
        let dialed = link.dialed().await;
        assert!(dialed.is_err());
        link.on_dialed(dialed);
        assert!(!link.is_connected());
        assert!(link.pending.is_some(), "a retry is scheduled");

        // The broker comes up on the same port; retries continue until it answers
        let listener = TcpListener::bind(&addr).await.unwrap();
        while !link.is_connected() {
            let dialed = link.dialed().await;
            link.on_dialed(dialed);
        }
        let (mut broker_side, _) = listener.accept().await.unwrap();
        assert_eq!(read_message(&mut broker_side).await, register("client123"));
    }
}
