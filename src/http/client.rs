//! HTTP egress for the upstream agent

use super::{headers_from_map, is_hop_by_hop, HttpClient, HttpError, HttpResponse, OutboundRequest};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::HOST;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

/// Plain-HTTP client backed by hyper's pooled client
#[derive(Clone)]
pub struct HyperClient {
    client: Client<HttpConnector, Full<Bytes>>,
    max_body_size: usize,
}

impl HyperClient {
    pub fn new(max_body_size: usize) -> Self {
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            client,
            max_body_size,
        }
    }
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn call(&self, request: OutboundRequest) -> Result<HttpResponse, HttpError> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpError::InvalidMethod(request.method.clone()))?;

        let mut builder = Request::builder().method(method).uri(request.url.as_str());
        for (name, value) in &request.headers {
            // Host follows the rewritten URL
            if is_hop_by_hop(name) || name.eq_ignore_ascii_case(HOST.as_str()) {
                continue;
            }
            for v in value.values() {
                builder = builder.header(name.as_str(), v);
            }
        }
        let req = builder
            .body(Full::new(Bytes::from(request.body)))
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;

        debug!("{} {}", req.method(), req.uri());
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_body_size)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    HttpError::BodyTooLarge(self.max_body_size)
                } else {
                    HttpError::Body(e.to_string())
                }
            })?
            .to_bytes();

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            headers: headers_from_map(&parts.headers),
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
