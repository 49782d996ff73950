//! HTTP capabilities
//!
//! The relay core never touches an HTTP library directly. The client agent receives
//! [`HttpExchange`]s from an ingress server and the upstream agent issues calls
//! through an [`HttpClient`]. Concrete hyper-based implementations live here.

mod client;
mod server;

pub use client::HyperClient;
pub use server::serve_http;

use crate::protocol::{HeaderValue, Headers};
use async_trait::async_trait;
use hyper::header::HeaderMap;
use thiserror::Error;
use tokio::sync::oneshot;
use url::Url;

/// HTTP errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Body error: {0}")]
    Body(String),

    #[error("Body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully buffered inbound HTTP request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: String,
}

/// A fully buffered HTTP response
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

impl HttpResponse {
    /// Response with a status and nothing else
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: String::new(),
        }
    }
}

/// An inbound request paired with the slot its response goes into
#[derive(Debug)]
pub struct HttpExchange {
    pub request: HttpRequest,
    pub respond: oneshot::Sender<HttpResponse>,
}

impl HttpExchange {
    pub fn new(request: HttpRequest) -> (Self, oneshot::Receiver<HttpResponse>) {
        let (respond, rx) = oneshot::channel();
        (Self { request, respond }, rx)
    }
}

/// A request to issue against the private server
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: String,
}

/// Capability to issue HTTP calls
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn call(&self, request: OutboundRequest) -> Result<HttpResponse, HttpError>;
}

/// Headers that describe a single hop and are never relayed.
/// `content-length` is recomputed from the buffered body.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Collect a hyper header map, folding repeated headers into lists
pub(crate) fn headers_from_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, value) in map {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match headers.get_mut(name.as_str()) {
            Some(existing) => existing.push(value),
            None => {
                headers.insert(name.as_str().to_string(), HeaderValue::Single(value));
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue as HyperHeaderValue};

    #[test]
    fn test_repeated_headers_fold_into_list() {
        let mut map = HeaderMap::new();
        let cookie = HeaderName::from_static("set-cookie");
        map.append(cookie.clone(), HyperHeaderValue::from_static("a=1"));
        map.append(cookie, HyperHeaderValue::from_static("b=2"));
        map.insert(
            HeaderName::from_static("content-type"),
            HyperHeaderValue::from_static("text/plain"),
        );

        let headers = headers_from_map(&map);
        assert_eq!(headers["content-type"], HeaderValue::from("text/plain"));
        assert_eq!(
            headers["set-cookie"],
            HeaderValue::Multi(vec!["a=1".into(), "b=2".into()])
        );
    }

    #[test]
    fn test_hop_by_hop() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("connection"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
