//! HTTP ingress for the client agent

use super::{headers_from_map, is_hop_by_hop, HttpError, HttpExchange, HttpRequest, HttpResponse};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Serve HTTP/1 on `listener`, handing every buffered request to `exchanges`.
///
/// Bodies larger than `max_body_size` are answered with 413 without being relayed.
pub async fn serve_http(
    listener: TcpListener,
    exchanges: mpsc::Sender<HttpExchange>,
    max_body_size: usize,
) -> Result<(), HttpError> {
    info!("HTTP listening on {}", listener.local_addr()?);
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        debug!("HTTP connection from {}", peer_addr);
        stream.set_nodelay(true).ok();

        let exchanges = exchanges.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let exchanges = exchanges.clone();
                async move { Ok::<_, Infallible>(handle(req, exchanges, max_body_size).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("HTTP connection error from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle(
    req: Request<Incoming>,
    exchanges: mpsc::Sender<HttpExchange>,
    max_body_size: usize,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    info!("Incoming request {} {}", parts.method, parts.uri);

    let body = match Limited::new(body, max_body_size).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!("Request body over {} bytes refused", max_body_size);
            return status_only(StatusCode::PAYLOAD_TOO_LARGE);
        }
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return status_only(StatusCode::BAD_REQUEST);
        }
    };

    let request = HttpRequest {
        method: parts.method.to_string(),
        url: request_url(&parts),
        headers: headers_from_map(&parts.headers),
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    let (exchange, response) = HttpExchange::new(request);
    if exchanges.send(exchange).await.is_err() {
        return status_only(StatusCode::BAD_GATEWAY);
    }
    match response.await {
        Ok(response) => into_hyper(response),
        Err(_) => status_only(StatusCode::BAD_GATEWAY),
    }
}

/// Absolute URL of the request, rebuilt from the Host header for origin-form targets
fn request_url(parts: &Parts) -> String {
    if parts.uri.scheme().is_some() {
        return parts.uri.to_string();
    }
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    match parts.headers.get(HOST).and_then(|h| h.to_str().ok()) {
        Some(host) => format!("http://{}{}", host, path),
        None => path.to_string(),
    }
}

fn into_hyper(response: HttpResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if is_hop_by_hop(name) {
            continue;
        }
        for v in value.values() {
            builder = builder.header(name.as_str(), v);
        }
    }
    builder
        .body(Full::new(Bytes::from(response.body)))
        .unwrap_or_else(|e| {
            warn!("Invalid relayed response: {}", e);
            status_only(StatusCode::BAD_GATEWAY)
        })
}

fn status_only(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpClient, HyperClient, OutboundRequest};
    use crate::protocol::{HeaderValue, Headers};
    use url::Url;

    async fn start(max_body_size: usize) -> (Url, mpsc::Receiver<HttpExchange>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(serve_http(listener, tx, max_body_size));
        (Url::parse(&format!("http://{}", addr)).unwrap(), rx)
    }

    fn post(base: &Url, path: &str, body: &str) -> OutboundRequest {
        let mut headers = Headers::new();
        headers.insert("x-trace".into(), HeaderValue::from("abc"));
        OutboundRequest {
            method: "POST".into(),
            url: base.join(path).unwrap(),
            headers,
            body: body.into(),
        }
    }

    #[tokio::test]
    async fn test_request_is_buffered_and_answered() {
        let (base, mut rx) = start(1024).await;

        let agent = tokio::spawn(async move {
            let exchange = rx.recv().await.unwrap();
            let req = exchange.request.clone();
            let mut headers = Headers::new();
            headers.insert("content-type".into(), HeaderValue::from("application/json"));
            headers.insert("transfer-encoding".into(), HeaderValue::from("chunked"));
            exchange
                .respond
                .send(HttpResponse {
                    status: 201,
                    headers,
                    body: "{\"blah\":\"deblah\"}".into(),
                })
                .unwrap();
            req
        });

        let client = HyperClient::new(1024);
        let response = client.call(post(&base, "/a/b/c?x=1", "hi")).await.unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(response.headers["content-type"], HeaderValue::from("application/json"));
        assert_eq!(response.body, "{\"blah\":\"deblah\"}");

        let seen = agent.await.unwrap();
        assert_eq!(seen.method, "POST");
        assert_eq!(seen.url, base.join("/a/b/c?x=1").unwrap().as_str());
        assert_eq!(seen.headers["x-trace"], HeaderValue::from("abc"));
        assert_eq!(seen.body, "hi");
    }

    #[tokio::test]
    async fn test_oversized_body_gets_413() {
        let (base, mut rx) = start(4).await;

        let client = HyperClient::new(1024);
        let response = client
            .call(post(&base, "/upload", "way more than four bytes"))
            .await
            .unwrap();
        assert_eq!(response.status, 413);
        assert!(rx.try_recv().is_err(), "oversized request must not be relayed");
    }

    #[tokio::test]
    async fn test_dropped_exchange_gets_502() {
        let (base, mut rx) = start(1024).await;
        tokio::spawn(async move {
            let exchange = rx.recv().await.unwrap();
            drop(exchange);
        });

        let client = HyperClient::new(1024);
        let response = client.call(post(&base, "/", "")).await.unwrap();
        assert_eq!(response.status, 502);
    }
}
