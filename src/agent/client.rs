//! Client agent
//!
//! Public side of the tunnel. Every inbound HTTP request is buffered, tracked under a
//! freshly minted `client_req_id` and relayed to the broker for the configured
//! upstream target. Exactly one of broker reply (status, default 200), broker error
//! (500) or local TTL expiry (504) answers the caller.
//!
//! When a stream listener is configured, each accepted stream connection becomes a
//! virtual connection: its events are forwarded to the broker untouched, tagged with
//! the connection id, and whatever the upstream side sends comes back the same way.

use super::BrokerLink;
use crate::http::{serve_http, HttpExchange, HttpResponse};
use crate::protocol::{
    epoch_millis, BrokerError, ClientRequest, Message, Role, StreamConnect, StreamDisconnect,
    StreamMessage, UpstreamResponse,
};
use crate::registry::Registry;
use crate::transport::{
    accept_loop, check_frame_size, ConnectionHandle, ConnectionId, Inbound, TransportError,
    TransportEvent, INBOX_CAPACITY,
};
use crate::{Result, DEFAULT_REQUEST_TTL};
use std::collections::HashMap;
use std::future::pending;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Client agent settings
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Registration id
    pub id: String,
    /// Upstream agent every request is routed to
    pub upstream_target: String,
    /// How long the caller waits before getting a 504
    pub request_ttl: Duration,
}

impl ClientOptions {
    pub fn new(id: impl Into<String>, upstream_target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            upstream_target: upstream_target.into(),
            request_ttl: DEFAULT_REQUEST_TTL,
        }
    }
}

/// A caller waiting for its response
#[derive(Debug)]
struct PendingHttp {
    respond: oneshot::Sender<HttpResponse>,
}

impl PendingHttp {
    fn answer(self, client_req_id: &str, response: HttpResponse) {
        debug!("Answering {} with {}", client_req_id, response.status);
        if self.respond.send(response).is_err() {
            debug!("Caller of {} went away", client_req_id);
        }
    }
}

/// The client agent state machine
pub struct ClientAgent {
    id: String,
    upstream_target: String,
    request_ttl: Duration,
    link: BrokerLink,
    requests: Registry<String, PendingHttp>,
    /// Local stream connections by virtual connection id
    streams: HashMap<String, ConnectionHandle>,
    stream_ids: HashMap<ConnectionId, String>,
}

impl ClientAgent {
    pub fn new(options: ClientOptions, link: BrokerLink) -> Self {
        Self {
            id: options.id,
            upstream_target: options.upstream_target,
            request_ttl: options.request_ttl,
            link,
            requests: Registry::new(),
            streams: HashMap::new(),
            stream_ids: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Number of callers awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Number of open virtual connections
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Connect to the broker and serve HTTP (and optionally streams) until a listener fails
    pub async fn serve(
        options: ClientOptions,
        broker_addr: String,
        http: TcpListener,
        streams: Option<TcpListener>,
        max_body_size: usize,
    ) -> Result<()> {
        info!(
            "Client agent \"{}\" relaying to \"{}\" via {}",
            options.id, options.upstream_target, broker_addr
        );
        let (broker_tx, broker_rx) = mpsc::channel(INBOX_CAPACITY);
        let link = BrokerLink::connect(Role::Client, options.id.clone(), broker_addr, broker_tx);
        let agent = ClientAgent::new(options, link);

        let (http_tx, http_rx) = mpsc::channel(INBOX_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(INBOX_CAPACITY);
        let accept_streams = async move {
            match streams {
                Some(listener) => {
                    info!("Stream connections on {}", listener.local_addr()?);
                    accept_loop(listener, stream_tx).await
                }
                None => {
                    drop(stream_tx);
                    pending::<std::result::Result<(), TransportError>>().await
                }
            }
        };

        tokio::select! {
            res = serve_http(http, http_tx, max_body_size) => res.map_err(Into::into),
            res = accept_streams => res.map_err(Into::into),
            _ = agent.run(broker_rx, http_rx, stream_rx) => Ok(()),
        }
    }

    /// Event loop over broker traffic, HTTP exchanges, stream events and deadlines
    pub async fn run(
        mut self,
        mut broker: mpsc::Receiver<Inbound>,
        mut http: mpsc::Receiver<HttpExchange>,
        mut streams: mpsc::Receiver<Inbound>,
    ) {
        loop {
            tokio::select! {
                dialed = self.link.dialed() => self.link.on_dialed(dialed),
                inbound = broker.recv() => match inbound {
                    Some(inbound) => self.handle_broker(inbound),
                    None => break,
                },
                exchange = http.recv() => match exchange {
                    Some(exchange) => self.handle_http(exchange),
                    None => break,
                },
                Some(inbound) = streams.recv() => self.handle_stream(inbound),
                (id, pending) = self.requests.expired() => self.on_request_timeout(id, pending),
            }
        }
        debug!("Client agent \"{}\" stopped", self.id);
    }

    /// Relay one buffered HTTP request into the tunnel
    pub fn handle_http(&mut self, exchange: HttpExchange) {
        let HttpExchange { request, respond } = exchange;
        let client_req_id = Uuid::new_v4().to_string();
        let client_req_ttl = epoch_millis() + self.request_ttl.as_millis() as u64;

        info!("{} {} as {}", request.method, request.url, client_req_id);
        let envelope = Message::ClientRequest(ClientRequest {
            client_id: self.id.clone(),
            client_req_id: client_req_id.clone(),
            client_req_ttl,
            upstream_target: self.upstream_target.clone(),
            method: request.method,
            url: request.url,
            headers: request.headers,
            body: request.body,
        })
        .into_envelope();
        if let Err(e) = check_frame_size(&envelope) {
            warn!("Request {} cannot be relayed: {}", client_req_id, e);
            PendingHttp { respond }.answer(&client_req_id, HttpResponse::status(413));
            return;
        }

        self.requests
            .put(client_req_id, PendingHttp { respond }, self.request_ttl);
        // While the broker is unreachable the request simply runs into its deadline
        self.link.emit(envelope);
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
                    self.close_streams();
                }
            }
            TransportEvent::Connected(_) => {}
        }
    }

    fn handle_message(&mut self, message: Message) {
        match message {
            Message::ClientRequestAck(ack) => {
                debug!("Request {} acked as {}", ack.client_req_id, ack.broker_req_id);
            }
            Message::BrokerResponse(response) => self.on_broker_response(response),
            Message::BrokerError(error) => self.on_broker_error(error),
            Message::UpstreamSioMessage(message) => self.on_upstream_message(message),
            Message::UpstreamSioDisconnect(disconnect) => self.on_upstream_disconnect(disconnect),
            other => debug!("Unexpected {} from broker", other.event()),
        }
    }

    fn on_broker_response(&mut self, response: UpstreamResponse) {
        trace!("broker_response {:?}", response);
        let Some(pending) = self.requests.take(&response.client_req_id) else {
            debug!("No pending request {}, dropping response", response.client_req_id);
            return;
        };
        pending.answer(
            &response.client_req_id,
            HttpResponse {
                status: response.status_code.unwrap_or(200),
                headers: response.headers,
                body: response.body,
            },
        );
    }

    fn on_broker_error(&mut self, error: BrokerError) {
        let Some(pending) = self.requests.take(&error.client_req_id) else {
            debug!("No pending request {}, dropping error", error.client_req_id);
            return;
        };
        warn!("Request {} failed: {}", error.client_req_id, error.error);
        pending.answer(&error.client_req_id, HttpResponse::status(500));
    }

    fn on_request_timeout(&mut self, client_req_id: String, pending: PendingHttp) {
        warn!("Request {} timed out", client_req_id);
        pending.answer(&client_req_id, HttpResponse::status(504));
    }

    /// Local stream connection events
    pub fn handle_stream(&mut self, inbound: Inbound) {
        let Inbound { conn, event } = inbound;
        match event {
            TransportEvent::Connected(handle) => {
                let connection = Uuid::new_v4().to_string();
                debug!("Stream {} opened as {}", conn, connection);
                self.stream_ids.insert(conn, connection.clone());
                self.streams.insert(connection.clone(), handle);
                self.link.emit(Message::ClientSioConnection(StreamConnect {
                    upstream: self.upstream_target.clone(),
                    connection,
                }));
            }
            TransportEvent::Message(message) => {
                let Some(connection) = self.stream_ids.get(&conn) else {
                    return;
                };
                self.link.emit(Message::ClientSioMessage(StreamMessage {
                    connection: connection.clone(),
                    message,
                }));
            }
            TransportEvent::Disconnect => {
                let Some(connection) = self.stream_ids.remove(&conn) else {
                    return;
                };
                debug!("Stream {} closed locally", connection);
                self.streams.remove(&connection);
                self.link
                    .emit(Message::ClientSioDisconnection(StreamDisconnect { connection }));
            }
        }
    }

    fn on_upstream_message(&mut self, message: StreamMessage) {
        match self.streams.get(&message.connection) {
            Some(stream) => stream.emit(message.message),
            None => debug!("Dropping message for unknown stream {}", message.connection),
        }
    }

    fn on_upstream_disconnect(&mut self, disconnect: StreamDisconnect) {
        let Some(stream) = self.streams.remove(&disconnect.connection) else {
            return;
        };
        debug!("Stream {} closed by upstream", disconnect.connection);
        self.stream_ids.remove(&stream.id());
        stream.disconnect();
    }

    /// Drop every local stream after losing the broker
    fn close_streams(&mut self) {
        for (connection, stream) in self.streams.drain() {
            debug!("Closing stream {}", connection);
            stream.disconnect();
        }
        self.stream_ids.clear();
    }
}
