//! Upstream agent
//!
//! Private side of the tunnel. Each `broker_request` is acknowledged, its URL is
//! rewritten onto the target address and the call is issued through the injected
//! [`HttpClient`]. The call runs on its own task; its result comes back to the agent
//! loop as a completion and is reported as `upstream_response` or `upstream_error`.
//! A call still running when its TTL passes is aborted and nothing is reported.
//!
//! With a stream peer configured, every `client_sio_connection` opens a new outbound
//! connection to that peer and traffic is forwarded opaquely by connection id.

use super::BrokerLink;
use crate::http::{HttpClient, HttpError, HttpResponse, OutboundRequest};
use crate::protocol::{
    BrokerRequest, BrokerRequestAck, Envelope, Message, RelayError, Role, StreamConnect,
    StreamDisconnect, StreamMessage, UpstreamError, UpstreamResponse,
};
use crate::registry::Registry;
use crate::transport::{
    check_frame_size, dial, spawn_connection, ConnectionHandle, ConnectionId, Inbound,
    TransportError, TransportEvent, CONNECT_TIMEOUT, INBOX_CAPACITY,
};
use crate::url_rewrite;
use crate::DEFAULT_UPSTREAM_TTL;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use url::Url;
use uuid::Uuid;

/// Upstream agent settings
#[derive(Debug, Clone)]
pub struct UpstreamOptions {
    /// Registration id, the name clients target
    pub id: String,
    /// Base URL of the private server
    pub target: Url,
    /// How long an HTTP call may run
    pub request_ttl: Duration,
    /// Address stream peers are opened to; streams are refused when unset
    pub stream_peer: Option<String>,
}

impl UpstreamOptions {
    pub fn new(id: impl Into<String>, target: Url) -> Self {
        Self {
            id: id.into(),
            target,
            request_ttl: DEFAULT_UPSTREAM_TTL,
            stream_peer: None,
        }
    }
}

/// An HTTP call in flight
#[derive(Debug)]
struct PendingCall {
    broker_req_id: String,
    client_req_id: String,
    task: AbortHandle,
}

/// Work finished off the agent loop
#[derive(Debug)]
enum Completion {
    Call {
        upstream_req_id: String,
        result: Result<HttpResponse, HttpError>,
    },
    Peer {
        connection: String,
        result: Result<TcpStream, TransportError>,
    },
}

#[derive(Debug)]
enum PeerState {
    /// Dialing; events from the client side wait here in order
    Connecting {
        queued: Vec<Envelope>,
        task: AbortHandle,
    },
    Open(ConnectionHandle),
}

/// The upstream agent state machine
pub struct UpstreamAgent {
    id: String,
    target: Url,
    request_ttl: Duration,
    stream_peer: Option<String>,
    http: Arc<dyn HttpClient>,
    link: BrokerLink,
    calls: Registry<String, PendingCall>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    peers: HashMap<String, PeerState>,
    peer_ids: HashMap<ConnectionId, String>,
    peer_tx: mpsc::Sender<Inbound>,
    peer_events: mpsc::Receiver<Inbound>,
}

impl UpstreamAgent {
    pub fn new(options: UpstreamOptions, http: Arc<dyn HttpClient>, link: BrokerLink) -> Self {
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (peer_tx, peer_events) = mpsc::channel(INBOX_CAPACITY);
        Self {
            id: options.id,
            target: options.target,
            request_ttl: options.request_ttl,
            stream_peer: options.stream_peer,
            http,
            link,
            calls: Registry::new(),
            completions_tx,
            completions,
            peers: HashMap::new(),
            peer_ids: HashMap::new(),
            peer_tx,
            peer_events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of HTTP calls in flight
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Number of stream peers, connecting or open
    pub fn open_peers(&self) -> usize {
        self.peers.len()
    }

    /// Connect to the broker and relay until the process stops
    pub async fn serve(options: UpstreamOptions, broker_addr: String, http: Arc<dyn HttpClient>) {
        info!(
            "Upstream agent \"{}\" serving {} via {}",
            options.id, options.target, broker_addr
        );
        let (broker_tx, broker_rx) = mpsc::channel(INBOX_CAPACITY);
        let link = BrokerLink::connect(Role::Upstream, options.id.clone(), broker_addr, broker_tx);
        UpstreamAgent::new(options, http, link).run(broker_rx).await
    }

    /// Event loop over broker traffic, completions, peer events and deadlines
    pub async fn run(mut self, mut broker: mpsc::Receiver<Inbound>) {
        loop {
            tokio::select! {
                dialed = self.link.dialed() => self.link.on_dialed(dialed),
                inbound = broker.recv() => match inbound {
                    Some(inbound) => self.handle_broker(inbound),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.on_completion(completion),
                Some(inbound) = self.peer_events.recv() => self.handle_peer(inbound),
                (id, call) = self.calls.expired() => self.on_call_timeout(id, call),
            }
        }
        debug!("Upstream agent \"{}\" stopped", self.id);
    }

    pub fn handle_broker(&mut self, inbound: Inbound) {
        let Inbound { conn, event } = inbound;
        if !self.link.is_current(conn) {
            trace!("Ignoring event from stale broker connection {}", conn);
            return;
        }
        match event {
            TransportEvent::Message(envelope) => match Message::from_envelope(envelope) {
                Ok(message) => self.handle_message(message),
                Err(e) => warn!("Dropping broker event: {}", e),
            },
            TransportEvent::Disconnect => {
                if self.link.on_disconnect(conn) {
                    self.close_peers();
                }
            }
            TransportEvent::Connected(_) => {}
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::BrokerRequest(request) => self.on_broker_request(request),
            Message::ClientSioConnection(connect) => self.on_stream_connect(connect),
            Message::ClientSioMessage(message) => self.on_stream_message(message),
            Message::ClientSioDisconnection(disconnect) => self.on_stream_disconnect(disconnect),
            other => debug!("Unexpected {} from broker", other.event()),
        }
    }

    fn on_broker_request(&mut self, request: BrokerRequest) {
        trace!("broker_request {:?}", request);
        let BrokerRequest {
            request,
            broker_req_id,
            ..
        } = request;
        let upstream_req_id = Uuid::new_v4().to_string();
        self.link.emit(Message::BrokerRequestAck(BrokerRequestAck {
            broker_req_id: broker_req_id.clone(),
            upstream_req_id: upstream_req_id.clone(),
        }));

        let url = match url_rewrite::rewrite(&self.target, &request.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("Request {}: {}", broker_req_id, e);
                self.link.emit(Message::UpstreamError(UpstreamError {
                    broker_req_id,
                    error: RelayError::new("RewriteError", e.to_string()),
                }));
                return;
            }
        };

        info!("{} {} as {}", request.method, url, upstream_req_id);
        let outbound = OutboundRequest {
            method: request.method,
            url,
            headers: request.headers,
            body: request.body,
        };
        let http = Arc::clone(&self.http);
        let completions = self.completions_tx.clone();
        let id = upstream_req_id.clone();
        let task = tokio::spawn(async move {
            let result = http.call(outbound).await;
            let _ = completions.send(Completion::Call {
                upstream_req_id: id,
                result,
            });
        });

        self.calls.put(
            upstream_req_id,
            PendingCall {
                broker_req_id,
                client_req_id: request.client_req_id,
                task: task.abort_handle(),
            },
            self.request_ttl,
        );
    }

    fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Call {
                upstream_req_id,
                result,
            } => self.on_call_done(upstream_req_id, result),
            Completion::Peer { connection, result } => self.on_peer_dialed(connection, result),
        }
    }

    fn on_call_done(&mut self, upstream_req_id: String, result: Result<HttpResponse, HttpError>) {
        let Some(call) = self.calls.take(&upstream_req_id) else {
            debug!("Call {} already expired, dropping result", upstream_req_id);
            return;
        };
        match result {
            Ok(response) => {
                debug!("Call {} answered {}", upstream_req_id, response.status);
                let broker_req_id = call.broker_req_id.clone();
                let envelope = Message::UpstreamResponse(UpstreamResponse {
                    client_req_id: call.client_req_id,
                    broker_req_id: call.broker_req_id,
                    upstream_req_id: upstream_req_id.clone(),
                    status_code: Some(response.status),
                    headers: response.headers,
                    body: response.body,
                })
                .into_envelope();
                // Sent as is it would be dropped by the transport
                if let Err(e) = check_frame_size(&envelope) {
                    warn!("Call {} response cannot be relayed: {}", upstream_req_id, e);
                    self.link.emit(Message::UpstreamError(UpstreamError {
                        broker_req_id,
                        error: RelayError::new("ResponseTooLarge", e.to_string()),
                    }));
                    return;
                }
                self.link.emit(envelope);
            }
            Err(e) => {
                warn!("Call {} failed: {}", upstream_req_id, e);
                self.link.emit(Message::UpstreamError(UpstreamError {
                    broker_req_id: call.broker_req_id,
                    error: RelayError::transport_call(e.to_string()),
                }));
            }
        }
    }

    fn on_call_timeout(&mut self, upstream_req_id: String, call: PendingCall) {
        warn!(
            "Call {} (broker request {}) timed out",
            upstream_req_id, call.broker_req_id
        );
        call.task.abort();
    }

    fn on_stream_connect(&mut self, connect: StreamConnect) {
        let StreamConnect { connection, .. } = connect;
        let Some(addr) = self.stream_peer.clone() else {
            debug!("Streams disabled, refusing {}", connection);
            self.link
                .emit(Message::UpstreamSioDisconnect(StreamDisconnect { connection }));
            return;
        };
        if self.peers.contains_key(&connection) {
            debug!("Stream {} already open", connection);
            return;
        }

        debug!("Opening peer {} for stream {}", addr, connection);
        let completions = self.completions_tx.clone();
        let id = connection.clone();
        let task = tokio::spawn(async move {
            let result = dial(&addr, CONNECT_TIMEOUT).await;
            let _ = completions.send(Completion::Peer {
                connection: id,
                result,
            });
        });
        self.peers.insert(
            connection,
            PeerState::Connecting {
                queued: Vec::new(),
                task: task.abort_handle(),
            },
        );
    }

    fn on_peer_dialed(&mut self, connection: String, result: Result<TcpStream, TransportError>) {
        let queued = match self.peers.remove(&connection) {
            Some(PeerState::Connecting { queued, .. }) => queued,
            Some(open @ PeerState::Open(_)) => {
                self.peers.insert(connection, open);
                return;
            }
            // Closed while dialing
            None => return,
        };

        match result {
            Ok(stream) => {
                let peer = spawn_connection(stream, self.peer_tx.clone());
                debug!("Stream {} open as {}", connection, peer.id());
                for message in queued {
                    peer.emit(message);
                }
                self.peer_ids.insert(peer.id(), connection.clone());
                self.peers.insert(connection, PeerState::Open(peer));
            }
            Err(e) => {
                warn!("Stream {} peer unreachable: {}", connection, e);
                self.link
                    .emit(Message::UpstreamSioDisconnect(StreamDisconnect { connection }));
            }
        }
    }

    fn on_stream_message(&mut self, message: StreamMessage) {
        match self.peers.get_mut(&message.connection) {
            Some(PeerState::Connecting { queued, .. }) => queued.push(message.message),
            Some(PeerState::Open(peer)) => peer.emit(message.message),
            None => debug!("Dropping message for unknown stream {}", message.connection),
        }
    }

    fn on_stream_disconnect(&mut self, disconnect: StreamDisconnect) {
        match self.peers.remove(&disconnect.connection) {
            Some(PeerState::Connecting { task, .. }) => task.abort(),
            Some(PeerState::Open(peer)) => {
                self.peer_ids.remove(&peer.id());
                peer.disconnect();
            }
            None => return,
        }
        debug!("Stream {} closed by client", disconnect.connection);
    }

    /// Peer connection events
    fn handle_peer(&mut self, inbound: Inbound) {
        let Inbound { conn, event } = inbound;
        match event {
            TransportEvent::Message(message) => {
                let Some(connection) = self.peer_ids.get(&conn) else {
                    return;
                };
                self.link.emit(Message::UpstreamSioMessage(StreamMessage {
                    connection: connection.clone(),
                    message,
                }));
            }
            TransportEvent::Disconnect => {
                let Some(connection) = self.peer_ids.remove(&conn) else {
                    return;
                };
                debug!("Stream {} closed by peer", connection);
                self.peers.remove(&connection);
                self.link
                    .emit(Message::UpstreamSioDisconnect(StreamDisconnect { connection }));
            }
            TransportEvent::Connected(_) => {}
        }
    }

    /// Drop every stream peer after losing the broker
    fn close_peers(&mut self) {
        for (connection, peer) in self.peers.drain() {
            debug!("Closing stream {}", connection);
            match peer {
                PeerState::Connecting { task, .. } => task.abort(),
                PeerState::Open(peer) => peer.disconnect(),
            }
        }
        self.peer_ids.clear();
    }
}
