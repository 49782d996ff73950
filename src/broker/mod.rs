//! Broker - the central relay
//!
//! Agents connect out to the broker and register under a name and a role. The
//! broker then:
//! - routes each `client_request` to the upstream agent registered under its
//!   `upstream_target`, tracking it under a freshly minted `broker_req_id`
//! - routes the terminal `upstream_response`/`upstream_error` back to the client
//!   agent that owns the request
//! - pairs client-side stream connections with upstream agents and forwards their
//!   traffic (see [`VirtualConnections`])
//!
//! All tables are owned by the broker task and only touched by its handlers.

mod multiplexer;

pub use multiplexer::{VirtualConnection, VirtualConnections};

use crate::protocol::{
    epoch_millis, BrokerError, BrokerRequest, ClientRequest, ClientRequestAck, Message,
    RelayError, Role, UpstreamError, UpstreamResponse,
};
use crate::registry::Registry;
use crate::transport::{
    accept_loop, ConnectionHandle, ConnectionId, Inbound, TransportEvent, INBOX_CAPACITY,
};
use crate::{Result, DEFAULT_REQUEST_TTL};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Broker settings
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Broker identity, stamped on every forwarded request
    pub id: String,
    /// How long a relayed request is tracked before it is abandoned
    pub request_ttl: Duration,
}

impl BrokerOptions {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request_ttl: DEFAULT_REQUEST_TTL,
        }
    }
}

/// Broker-side record of one relayed request
#[derive(Debug, Clone)]
struct RelayRecord {
    client_id: String,
    client_req_id: String,
    upstream_target: String,
}

/// Agents of one role, by registered id
#[derive(Debug, Default)]
pub struct Registrations {
    agents: HashMap<String, ConnectionHandle>,
}

impl Registrations {
    /// Bind `id` to `conn`, returning the connection it replaced
    pub fn bind(&mut self, id: String, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        self.agents.insert(id, conn)
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionHandle> {
        self.agents.get(id)
    }

    /// Remove the binding only if it still points at `conn`
    pub fn unbind(&mut self, id: &str, conn: ConnectionId) -> bool {
        match self.agents.get(id) {
            Some(handle) if handle.id() == conn => {
                self.agents.remove(id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }
}

/// The broker state machine
pub struct Broker {
    id: String,
    request_ttl: Duration,
    /// Every live inbound connection, registered or not
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Which registration each connection holds
    bindings: HashMap<ConnectionId, (Role, String)>,
    clients: Registrations,
    upstreams: Registrations,
    requests: Registry<String, RelayRecord>,
    streams: VirtualConnections,
}

impl Broker {
    pub fn new(options: BrokerOptions) -> Self {
        Self::with_tables(
            options,
            Registrations::default(),
            Registrations::default(),
            VirtualConnections::default(),
        )
    }

    /// Build a broker around explicitly provided tables
    pub fn with_tables(
        options: BrokerOptions,
        clients: Registrations,
        upstreams: Registrations,
        streams: VirtualConnections,
    ) -> Self {
        Self {
            id: options.id,
            request_ttl: options.request_ttl,
            connections: HashMap::new(),
            bindings: HashMap::new(),
            clients,
            upstreams,
            requests: Registry::new(),
            streams,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of relayed requests awaiting a terminal reply
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn virtual_connections(&self) -> &VirtualConnections {
        &self.streams
    }

    pub fn is_registered(&self, role: Role, id: &str) -> bool {
        self.table(role).contains(id)
    }

    /// Accept agents on `listener` and run until the listener fails
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        info!("Broker \"{}\" listening on {}", self.id, listener.local_addr()?);
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::select! {
            res = accept_loop(listener, tx) => res.map_err(Into::into),
            _ = self.run(rx) => Ok(()),
        }
    }

    /// Event loop: transport events and request deadlines, one at a time
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                inbound = inbox.recv() => match inbound {
                    Some(inbound) => self.handle_inbound(inbound),
                    None => break,
                },
                (id, record) = self.requests.expired() => self.on_request_timeout(id, record),
            }
        }
        debug!("Broker inbox closed");
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { conn, event } = inbound;
        match event {
            TransportEvent::Connected(handle) => {
                self.connections.insert(conn, handle);
            }
            TransportEvent::Message(envelope) => match Message::from_envelope(envelope) {
                Ok(message) => self.handle_message(conn, message),
                Err(e) => warn!("Dropping event from {}: {}", conn, e),
            },
            TransportEvent::Disconnect => self.on_disconnect(conn),
        }
    }

    fn handle_message(&mut self, conn: ConnectionId, message: Message) {
        if let Message::Register { role, id } = message {
            return self.register(conn, &role, id);
        }

        let Some((role, agent_id)) = self.bindings.get(&conn).cloned() else {
            debug!("Ignoring {} from unregistered {}", message.event(), conn);
            return;
        };

        match (role, message) {
            (Role::Client, Message::ClientRequest(payload)) => self.relay(&agent_id, payload),
            (Role::Client, Message::ClientSioConnection(payload)) => {
                self.on_client_connect(&agent_id, payload)
            }
            (Role::Client, Message::ClientSioMessage(payload)) => {
                self.on_client_message(&agent_id, payload)
            }
            (Role::Client, Message::ClientSioDisconnection(payload)) => {
                self.on_client_disconnect(&agent_id, payload)
            }
            (Role::Upstream, Message::BrokerRequestAck(ack)) => {
                trace!("Request {} acked as {}", ack.broker_req_id, ack.upstream_req_id);
            }
            (Role::Upstream, Message::UpstreamResponse(payload)) => self.on_upstream_reply(payload),
            (Role::Upstream, Message::UpstreamError(payload)) => self.on_upstream_error(payload),
            (Role::Upstream, Message::UpstreamSioMessage(payload)) => {
                self.on_upstream_message(&agent_id, payload)
            }
            (Role::Upstream, Message::UpstreamSioDisconnect(payload)) => {
                self.on_upstream_disconnect(&agent_id, payload)
            }
            (role, other) => {
                debug!("Unexpected {} from {} \"{}\"", other.event(), role, agent_id);
            }
        }
    }

    fn register(&mut self, conn: ConnectionId, role: &str, id: String) {
        let Some(handle) = self.connections.get(&conn).cloned() else {
            return;
        };
        let role: Role = match role.parse() {
            Ok(role) => role,
            Err(e) => {
                warn!("Refusing registration of \"{}\" on {}: {}", id, conn, e);
                handle.disconnect();
                return;
            }
        };

        // A connection holds at most one registration
        if let Some((old_role, old_id)) = self.bindings.remove(&conn) {
            if (old_role, old_id.as_str()) == (role, id.as_str()) {
                self.bindings.insert(conn, (role, id));
                return;
            }
            if self.table_mut(old_role).unbind(&old_id, conn) {
                self.close_streams_of(old_role, &old_id);
            }
        }

        if let Some(previous) = self.table_mut(role).bind(id.clone(), handle) {
            warn!(
                "{} \"{}\" re-registered on {}, disconnecting {}",
                role,
                id,
                conn,
                previous.id()
            );
            // Streams of the superseded connection cannot move to the new one
            self.bindings.remove(&previous.id());
            self.close_streams_of(role, &id);
            previous.disconnect();
        }
        self.bindings.insert(conn, (role, id.clone()));
        info!("{} \"{}\" registered", role, id);
    }

    fn on_disconnect(&mut self, conn: ConnectionId) {
        self.connections.remove(&conn);
        let Some((role, id)) = self.bindings.remove(&conn) else {
            return;
        };
        if self.table_mut(role).unbind(&id, conn) {
            info!("{} \"{}\" disconnected", role, id);
            self.close_streams_of(role, &id);
        }
    }

    /// Forward a client request to its upstream target
    fn relay(&mut self, client_id: &str, request: ClientRequest) {
        trace!("client_request {:?}", request);
        let Some(client) = self.clients.get(client_id).cloned() else {
            return;
        };

        let Some(upstream) = self.upstreams.get(&request.upstream_target) else {
            let error = RelayError::routing(&request.upstream_target);
            warn!("Request {} from \"{}\": {}", request.client_req_id, client_id, error.message);
            client.emit(Message::BrokerError(BrokerError {
                client_req_id: request.client_req_id,
                error,
            }));
            return;
        };

        let broker_req_id = Uuid::new_v4().to_string();
        let broker_req_ttl = epoch_millis() + self.request_ttl.as_millis() as u64;
        self.requests.put(
            broker_req_id.clone(),
            RelayRecord {
                client_id: client_id.to_string(),
                client_req_id: request.client_req_id.clone(),
                upstream_target: request.upstream_target.clone(),
            },
            self.request_ttl,
        );

        info!("Sending request {} with ttl {}", broker_req_id, broker_req_ttl);
        let ack = ClientRequestAck {
            client_req_id: request.client_req_id.clone(),
            broker_req_id: broker_req_id.clone(),
        };
        upstream.emit(Message::BrokerRequest(BrokerRequest {
            request,
            broker_id: self.id.clone(),
            broker_req_id,
            broker_req_ttl,
        }));
        client.emit(Message::ClientRequestAck(ack));
    }

    fn on_upstream_reply(&mut self, mut response: UpstreamResponse) {
        trace!("upstream_response {:?}", response);
        let Some(record) = self.requests.take(&response.broker_req_id) else {
            debug!("No pending request {}, dropping response", response.broker_req_id);
            return;
        };
        let Some(client) = self.clients.get(&record.client_id) else {
            debug!("Client \"{}\" gone, dropping response {}", record.client_id, response.broker_req_id);
            return;
        };

        debug!("Sending {} broker response", response.broker_req_id);
        response.client_req_id = record.client_req_id;
        client.emit(Message::BrokerResponse(response));
    }

    fn on_upstream_error(&mut self, payload: UpstreamError) {
        trace!("upstream_error {:?}", payload);
        let Some(record) = self.requests.take(&payload.broker_req_id) else {
            debug!("No pending request {}, dropping error", payload.broker_req_id);
            return;
        };
        let Some(client) = self.clients.get(&record.client_id) else {
            debug!("Client \"{}\" gone, dropping error {}", record.client_id, payload.broker_req_id);
            return;
        };

        debug!("Sending {} broker error {}", payload.broker_req_id, payload.error);
        client.emit(Message::BrokerError(BrokerError {
            client_req_id: record.client_req_id,
            error: payload.error,
        }));
    }

    /// Janitorial only: the client agent's own deadline is what answers the caller.
    fn on_request_timeout(&mut self, id: String, record: RelayRecord) {
        warn!(
            "Request {} (client \"{}\" req {}, upstream \"{}\") timed out",
            id, record.client_id, record.client_req_id, record.upstream_target
        );
    }

    fn table(&self, role: Role) -> &Registrations {
        match role {
            Role::Client => &self.clients,
            Role::Upstream => &self.upstreams,
        }
    }

    fn table_mut(&mut self, role: Role) -> &mut Registrations {
        match role {
            Role::Client => &mut self.clients,
            Role::Upstream => &mut self.upstreams,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::protocol::Envelope;
    use crate::transport::Outgoing;
    use tokio::sync::mpsc::UnboundedReceiver;

    pub struct Peer {
        pub conn: ConnectionId,
        pub rx: UnboundedReceiver<Outgoing>,
    }

    impl Peer {
        /// Next message the broker sent to this peer, if any
        pub fn try_message(&mut self) -> Option<Message> {
            match self.rx.try_recv().ok()? {
                Outgoing::Emit(env) => Some(Message::from_envelope(env).unwrap()),
                Outgoing::Disconnect => panic!("unexpected disconnect"),
            }
        }

        pub fn message(&mut self) -> Message {
            self.try_message().expect("expected a message")
        }

        pub fn try_outgoing(&mut self) -> Option<Outgoing> {
            self.rx.try_recv().ok()
        }
    }

    pub fn broker() -> Broker {
        Broker::new(BrokerOptions {
            id: "broker".into(),
            request_ttl: Duration::from_millis(100),
        })
    }

    pub fn connect(broker: &mut Broker) -> Peer {
        let (handle, rx) = ConnectionHandle::channel();
        let conn = handle.id();
        broker.handle_inbound(Inbound {
            conn,
            event: TransportEvent::Connected(handle),
        });
        Peer { conn, rx }
    }

    pub fn send(broker: &mut Broker, peer: &Peer, message: Message) {
        send_envelope(broker, peer, message.into_envelope());
    }

    pub fn send_envelope(broker: &mut Broker, peer: &Peer, envelope: Envelope) {
        broker.handle_inbound(Inbound {
            conn: peer.conn,
            event: TransportEvent::Message(envelope),
        });
    }

    pub fn drop_peer(broker: &mut Broker, peer: &Peer) {
        broker.handle_inbound(Inbound {
            conn: peer.conn,
            event: TransportEvent::Disconnect,
        });
    }

    pub fn register(broker: &mut Broker, role: &str, id: &str) -> Peer {
        let peer = connect(broker);
        send(
            broker,
            &peer,
            Message::Register {
                role: role.into(),
                id: id.into(),
            },
        );
        peer
    }
}
