//! Typed tunnel messages and their payloads

use super::{events, Envelope, ProtocolError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// A single header value, or the list of values of a repeated header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::Multi(vs) => vs,
        };
        slice.iter().map(String::as_str)
    }

    /// Append another value, turning a single value into a list.
    pub fn push(&mut self, value: String) {
        match self {
            HeaderValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = HeaderValue::Multi(vec![first, value]);
            }
            HeaderValue::Multi(vs) => vs.push(value),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

/// Header map keyed by lowercase header name
pub type Headers = BTreeMap<String, HeaderValue>;

/// Error carried across the wire as data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayError {
    #[serde(default = "RelayError::default_name")]
    pub name: String,
    pub message: String,
}

impl RelayError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Named upstream target is not registered with the broker
    pub fn routing(target: &str) -> Self {
        Self::new(
            "RoutingError",
            format!("Upstream target \"{}\" not found", target),
        )
    }

    /// The real HTTP call to the private server failed
    pub fn transport_call(message: impl Into<String>) -> Self {
        Self::new("TransportCallError", message)
    }

    fn default_name() -> String {
        "Error".to_string()
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// `client_request`: client agent -> broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub client_id: String,
    pub client_req_id: String,
    pub client_req_ttl: u64,
    pub upstream_target: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

/// `client_request_ack`: broker -> client agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequestAck {
    pub client_req_id: String,
    pub broker_req_id: String,
}

/// `broker_request`: broker -> upstream agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerRequest {
    #[serde(flatten)]
    pub request: ClientRequest,
    pub broker_id: String,
    pub broker_req_id: String,
    pub broker_req_ttl: u64,
}

/// `broker_request_ack`: upstream agent -> broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerRequestAck {
    pub broker_req_id: String,
    pub upstream_req_id: String,
}

/// `upstream_response` and `broker_response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamResponse {
    pub client_req_id: String,
    pub broker_req_id: String,
    #[serde(default)]
    pub upstream_req_id: String,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

/// `upstream_error`: upstream agent -> broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamError {
    pub broker_req_id: String,
    pub error: RelayError,
}

/// `broker_error`: broker -> client agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerError {
    pub client_req_id: String,
    pub error: RelayError,
}

/// `client_sio_connection`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConnect {
    pub upstream: String,
    pub connection: String,
}

/// `client_sio_message` / `upstream_sio_message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub connection: String,
    pub message: Envelope,
}

/// `client_sio_disconnection` / `upstream_sio_disconnect`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDisconnect {
    pub connection: String,
}

/// Every event exchanged on a tunnel connection
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Role is kept raw so an unrecognized role can be refused by the broker
    Register { role: String, id: String },
    ClientRequest(ClientRequest),
    ClientRequestAck(ClientRequestAck),
    BrokerRequest(BrokerRequest),
    BrokerRequestAck(BrokerRequestAck),
    UpstreamResponse(UpstreamResponse),
    UpstreamError(UpstreamError),
    BrokerResponse(UpstreamResponse),
    BrokerError(BrokerError),
    ClientSioConnection(StreamConnect),
    ClientSioMessage(StreamMessage),
    ClientSioDisconnection(StreamDisconnect),
    UpstreamSioMessage(StreamMessage),
    UpstreamSioDisconnect(StreamDisconnect),
}

impl Message {
    /// Wire name of this message
    pub fn event(&self) -> &'static str {
        match self {
            Message::Register { .. } => events::REGISTER,
            Message::ClientRequest(_) => events::CLIENT_REQUEST,
            Message::ClientRequestAck(_) => events::CLIENT_REQUEST_ACK,
            Message::BrokerRequest(_) => events::BROKER_REQUEST,
            Message::BrokerRequestAck(_) => events::BROKER_REQUEST_ACK,
            Message::UpstreamResponse(_) => events::UPSTREAM_RESPONSE,
            Message::UpstreamError(_) => events::UPSTREAM_ERROR,
            Message::BrokerResponse(_) => events::BROKER_RESPONSE,
            Message::BrokerError(_) => events::BROKER_ERROR,
            Message::ClientSioConnection(_) => events::CLIENT_SIO_CONNECTION,
            Message::ClientSioMessage(_) => events::CLIENT_SIO_MESSAGE,
            Message::ClientSioDisconnection(_) => events::CLIENT_SIO_DISCONNECTION,
            Message::UpstreamSioMessage(_) => events::UPSTREAM_SIO_MESSAGE,
            Message::UpstreamSioDisconnect(_) => events::UPSTREAM_SIO_DISCONNECT,
        }
    }

    /// Decode a tunnel envelope
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { event, args } = envelope;
        let mut args = args.into_iter();
        let message = match event.as_str() {
            events::REGISTER => {
                let role = arg(&mut args, events::REGISTER, 0)?;
                let id = arg(&mut args, events::REGISTER, 1)?;
                Message::Register { role, id }
            }
            events::CLIENT_REQUEST => Message::ClientRequest(arg(&mut args, events::CLIENT_REQUEST, 0)?),
            events::CLIENT_REQUEST_ACK => {
                Message::ClientRequestAck(arg(&mut args, events::CLIENT_REQUEST_ACK, 0)?)
            }
            events::BROKER_REQUEST => Message::BrokerRequest(arg(&mut args, events::BROKER_REQUEST, 0)?),
            events::BROKER_REQUEST_ACK => {
                Message::BrokerRequestAck(arg(&mut args, events::BROKER_REQUEST_ACK, 0)?)
            }
            events::UPSTREAM_RESPONSE => {
                Message::UpstreamResponse(arg(&mut args, events::UPSTREAM_RESPONSE, 0)?)
            }
            events::UPSTREAM_ERROR => Message::UpstreamError(arg(&mut args, events::UPSTREAM_ERROR, 0)?),
            events::BROKER_RESPONSE => {
                Message::BrokerResponse(arg(&mut args, events::BROKER_RESPONSE, 0)?)
            }
            events::BROKER_ERROR => Message::BrokerError(arg(&mut args, events::BROKER_ERROR, 0)?),
            events::CLIENT_SIO_CONNECTION => {
                Message::ClientSioConnection(arg(&mut args, events::CLIENT_SIO_CONNECTION, 0)?)
            }
            events::CLIENT_SIO_MESSAGE => {
                Message::ClientSioMessage(arg(&mut args, events::CLIENT_SIO_MESSAGE, 0)?)
            }
            events::CLIENT_SIO_DISCONNECTION => {
                Message::ClientSioDisconnection(arg(&mut args, events::CLIENT_SIO_DISCONNECTION, 0)?)
            }
            events::UPSTREAM_SIO_MESSAGE => {
                Message::UpstreamSioMessage(arg(&mut args, events::UPSTREAM_SIO_MESSAGE, 0)?)
            }
            events::UPSTREAM_SIO_DISCONNECT => {
                Message::UpstreamSioDisconnect(arg(&mut args, events::UPSTREAM_SIO_DISCONNECT, 0)?)
            }
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(message)
    }

    /// Encode for the wire
    pub fn into_envelope(self) -> Envelope {
        let event = self.event();
        let args = match self {
            Message::Register { role, id } => vec![Value::String(role), Value::String(id)],
            Message::ClientRequest(p) => vec![payload(p)],
            Message::ClientRequestAck(p) => vec![payload(p)],
            Message::BrokerRequest(p) => vec![payload(p)],
            Message::BrokerRequestAck(p) => vec![payload(p)],
            Message::UpstreamResponse(p) | Message::BrokerResponse(p) => vec![payload(p)],
            Message::UpstreamError(p) => vec![payload(p)],
            Message::BrokerError(p) => vec![payload(p)],
            Message::ClientSioConnection(p) => vec![payload(p)],
            Message::ClientSioMessage(p) | Message::UpstreamSioMessage(p) => vec![payload(p)],
            Message::ClientSioDisconnection(p) | Message::UpstreamSioDisconnect(p) => {
                vec![payload(p)]
            }
        };
        Envelope::new(event, args)
    }
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        message.into_envelope()
    }
}

fn arg<T: DeserializeOwned>(
    args: &mut impl Iterator<Item = Value>,
    event: &'static str,
    index: usize,
) -> Result<T, ProtocolError> {
    let value = args
        .next()
        .ok_or(ProtocolError::MissingArgument { event, index })?;
    serde_json::from_value(value).map_err(|source| ProtocolError::MalformedPayload { event, source })
}

// Payload types only hold strings, integers and string-keyed maps, which always serialize.
fn payload<T: Serialize>(p: T) -> Value {
    serde_json::to_value(p).unwrap_or(Value::Null)
}
