//! Virtual connection multiplexer
//!
//! Tunnels arbitrary event streams between a client agent's stream listener and a
//! peer connection opened by an upstream agent. The broker is the only place that
//! knows both ends of a virtual connection; traffic is routed by connection id and
//! never interpreted.

use super::Broker;
use crate::protocol::{Message, Role, StreamConnect, StreamDisconnect, StreamMessage};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Broker record of one tunneled stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualConnection {
    /// Connection id minted by the client agent
    pub id: String,
    /// Owning client agent
    pub client: String,
    /// Upstream agent the stream is paired with
    pub upstream: String,
}

impl VirtualConnection {
    fn owner(&self, role: Role) -> &str {
        match role {
            Role::Client => &self.client,
            Role::Upstream => &self.upstream,
        }
    }
}

/// Active virtual connections, by connection id
#[derive(Debug, Default)]
pub struct VirtualConnections {
    conns: HashMap<String, VirtualConnection>,
}

impl VirtualConnections {
    pub fn open(&mut self, conn: VirtualConnection) -> Option<VirtualConnection> {
        self.conns.insert(conn.id.clone(), conn)
    }

    pub fn get(&self, id: &str) -> Option<&VirtualConnection> {
        self.conns.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conns.contains_key(id)
    }

    /// Look up `id` as seen from the `role` side; foreign agents get nothing
    fn get_owned(&self, id: &str, role: Role, agent: &str) -> Option<&VirtualConnection> {
        self.conns.get(id).filter(|vc| vc.owner(role) == agent)
    }

    /// Remove `id` if the `role` side of it belongs to `agent`
    fn remove_owned(&mut self, id: &str, role: Role, agent: &str) -> Option<VirtualConnection> {
        self.get_owned(id, role, agent)?;
        self.conns.remove(id)
    }

    /// Remove every connection the agent takes part in on the given side
    fn drain_owned_by(&mut self, role: Role, agent: &str) -> Vec<VirtualConnection> {
        let ids: Vec<String> = self
            .conns
            .values()
            .filter(|vc| vc.owner(role) == agent)
            .map(|vc| vc.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.conns.remove(id)).collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl Broker {
    pub(super) fn on_client_connect(&mut self, client_id: &str, connect: StreamConnect) {
        let Some(client) = self.clients.get(client_id) else {
            return;
        };
        if self.streams.contains(&connect.connection) {
            warn!("Ignoring connect for stream {}: already open", connect.connection);
            return;
        }
        let Some(upstream) = self.upstreams.get(&connect.upstream) else {
            warn!(
                "Refusing stream {}: upstream target \"{}\" not found",
                connect.connection, connect.upstream
            );
            client.emit(Message::UpstreamSioDisconnect(StreamDisconnect {
                connection: connect.connection,
            }));
            return;
        };

        debug!("Stream {} from \"{}\" to \"{}\"", connect.connection, client_id, connect.upstream);
        upstream.emit(Message::ClientSioConnection(connect.clone()));
        self.streams.open(VirtualConnection {
            id: connect.connection,
            client: client_id.to_string(),
            upstream: connect.upstream,
        });
    }

    pub(super) fn on_client_message(&mut self, client_id: &str, message: StreamMessage) {
        let Some(vc) = self.streams.get_owned(&message.connection, Role::Client, client_id) else {
            debug!("Dropping message for unknown stream {}", message.connection);
            return;
        };
        if let Some(upstream) = self.upstreams.get(&vc.upstream) {
            upstream.emit(Message::ClientSioMessage(message));
        }
    }

    pub(super) fn on_upstream_message(&mut self, upstream_id: &str, message: StreamMessage) {
        let Some(vc) = self.streams.get_owned(&message.connection, Role::Upstream, upstream_id)
        else {
            debug!("Dropping message for unknown stream {}", message.connection);
            return;
        };
        if let Some(client) = self.clients.get(&vc.client) {
            client.emit(Message::UpstreamSioMessage(message));
        }
    }

    pub(super) fn on_client_disconnect(&mut self, client_id: &str, disconnect: StreamDisconnect) {
        let Some(vc) = self
            .streams
            .remove_owned(&disconnect.connection, Role::Client, client_id)
        else {
            return;
        };
        debug!("Stream {} closed by client \"{}\"", vc.id, client_id);
        if let Some(upstream) = self.upstreams.get(&vc.upstream) {
            upstream.emit(Message::ClientSioDisconnection(disconnect));
        }
    }

    pub(super) fn on_upstream_disconnect(&mut self, upstream_id: &str, disconnect: StreamDisconnect) {
        let Some(vc) = self
            .streams
            .remove_owned(&disconnect.connection, Role::Upstream, upstream_id)
        else {
            return;
        };
        debug!("Stream {} closed by upstream \"{}\"", vc.id, upstream_id);
        if let Some(client) = self.clients.get(&vc.client) {
            client.emit(Message::UpstreamSioDisconnect(disconnect));
        }
    }

    /// Tear down every stream of an agent that went away, notifying the other side
    pub(super) fn close_streams_of(&mut self, role: Role, agent: &str) {
        for vc in self.streams.drain_owned_by(role, agent) {
            let disconnect = StreamDisconnect {
                connection: vc.id.clone(),
            };
            match role {
                Role::Client => {
                    if let Some(upstream) = self.upstreams.get(&vc.upstream) {
                        upstream.emit(Message::ClientSioDisconnection(disconnect));
                    }
                }
                Role::Upstream => {
                    if let Some(client) = self.clients.get(&vc.client) {
                        client.emit(Message::UpstreamSioDisconnect(disconnect));
                    }
                }
            }
        }
    }
}
