//! Integration tests for the tunnel broker
//!
//! Runs a broker, a client agent and an upstream agent over loopback TCP in front of
//! a scripted private HTTP server, and drives them the way real callers would:
//! - HTTP round trip through all three hops
//! - Routing errors and client-side timeouts
//! - Tunneled stream connections in both directions

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tunnel_broker::agent::{ClientAgent, ClientOptions, UpstreamAgent, UpstreamOptions};
use tunnel_broker::broker::{Broker, BrokerOptions};
use tunnel_broker::http::{
    serve_http, HttpClient, HttpExchange, HttpResponse, HyperClient, OutboundRequest,
};
use tunnel_broker::protocol::{Envelope, HeaderValue, Headers};
use tunnel_broker::transport::{accept_loop, connect, Inbound, TransportEvent};
use tunnel_broker::url_rewrite::parse_target;
use url::Url;

const BODY_LIMIT: usize = 1024 * 1024;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

/// Private HTTP server. Echoes what it saw in response headers; never answers `/hang`.
async fn private_server() -> String {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = mpsc::channel::<HttpExchange>(16);
    tokio::spawn(serve_http(listener, tx, BODY_LIMIT));
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(exchange) = rx.recv().await {
            let url = Url::parse(&exchange.request.url).unwrap();
            if url.path() == "/hang" {
                held.push(exchange);
                continue;
            }
            let mut headers = Headers::new();
            headers.insert("content-type".into(), HeaderValue::from("application/json"));
            headers.insert("x-seen-path".into(), HeaderValue::from(url.path()));
            headers.insert(
                "x-seen-query".into(),
                HeaderValue::from(url.query().unwrap_or("")),
            );
            if let Some(trace) = exchange.request.headers.get("x-trace") {
                headers.insert("x-seen-trace".into(), trace.clone());
            }
            headers.insert(
                "x-seen-body".into(),
                HeaderValue::from(exchange.request.body.as_str()),
            );
            let _ = exchange.respond.send(HttpResponse {
                status: 200,
                headers,
                body: "{\"blah\":\"deblah\"}".into(),
            });
        }
    });
    addr
}

/// Stream peer that echoes every event, closes on `bye`, and reports closed connections
async fn echo_peer() -> (String, mpsc::Receiver<()>) {
    let (listener, addr) = bind().await;
    let (tx, mut rx) = mpsc::channel(16);
    tokio::spawn(accept_loop(listener, tx));

    let (closed_tx, closed_rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut conns = HashMap::new();
        while let Some(Inbound { conn, event }) = rx.recv().await {
            match event {
                TransportEvent::Connected(handle) => {
                    conns.insert(conn, handle);
                }
                TransportEvent::Message(envelope) => {
                    if let Some(handle) = conns.get(&conn) {
                        if envelope.event == "bye" {
                            handle.disconnect();
                        } else {
                            handle.emit(envelope);
                        }
                    }
                }
                TransportEvent::Disconnect => {
                    conns.remove(&conn);
                    let _ = closed_tx.send(()).await;
                }
            }
        }
    });
    (addr, closed_rx)
}

async fn start_broker() -> String {
    let (listener, addr) = bind().await;
    let broker = Broker::new(BrokerOptions::new("broker"));
    tokio::spawn(broker.serve(listener));
    addr
}

async fn start_upstream(broker: &str, target: &str, stream_peer: Option<String>) {
    let options = UpstreamOptions {
        id: "upstream123".into(),
        target: parse_target(&format!("http://{}", target)).unwrap(),
        request_ttl: Duration::from_secs(30),
        stream_peer,
    };
    let http = Arc::new(HyperClient::new(BODY_LIMIT));
    tokio::spawn(UpstreamAgent::serve(options, broker.to_string(), http));
}

/// Start a client agent; returns its HTTP base URL and stream address
async fn start_client(broker: &str, upstream_target: &str, ttl: Duration) -> (Url, String) {
    let (http, http_addr) = bind().await;
    let (streams, stream_addr) = bind().await;
    let options = ClientOptions {
        id: "client123".into(),
        upstream_target: upstream_target.into(),
        request_ttl: ttl,
    };
    tokio::spawn(ClientAgent::serve(
        options,
        broker.to_string(),
        http,
        Some(streams),
        BODY_LIMIT,
    ));
    (Url::parse(&format!("http://{}", http_addr)).unwrap(), stream_addr)
}

async fn get(base: &Url, path: &str, headers: Headers, body: &str) -> HttpResponse {
    HyperClient::new(BODY_LIMIT)
        .call(OutboundRequest {
            method: if body.is_empty() { "GET" } else { "POST" }.into(),
            url: base.join(path).unwrap(),
            headers,
            body: body.into(),
        })
        .await
        .unwrap()
}

/// Retry until the request gets `status`, while the agents are still registering
async fn wait_for_status(base: &Url, status: u16) {
    for _ in 0..100 {
        if get(base, "/ready", Headers::new(), "").await.status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("never answered {}", status);
}

#[tokio::test]
async fn test_http_round_trip() {
    let private = private_server().await;
    let broker = start_broker().await;
    start_upstream(&broker, &private, None).await;
    let (base, _) = start_client(&broker, "upstream123", Duration::from_millis(500)).await;
    wait_for_status(&base, 200).await;

    let mut headers = Headers::new();
    headers.insert("x-trace".into(), HeaderValue::from("abc"));
    let response = get(&base, "/a/b/c?x=1", headers, "hi").await;

    assert_eq!(response.status, 200);
    assert_eq!(response.headers["content-type"], HeaderValue::from("application/json"));
    assert_eq!(response.body, "{\"blah\":\"deblah\"}");
    assert_eq!(response.headers["x-seen-path"], HeaderValue::from("/a/b/c"));
    assert_eq!(response.headers["x-seen-query"], HeaderValue::from("x=1"));
    assert_eq!(response.headers["x-seen-trace"], HeaderValue::from("abc"));
    assert_eq!(response.headers["x-seen-body"], HeaderValue::from("hi"));
}

#[tokio::test]
async fn test_unknown_target_is_500() {
    let broker = start_broker().await;
    let (base, _) = start_client(&broker, "upstream123", Duration::from_millis(300)).await;

    // 504 until the client agent is registered, then the broker refuses the route
    wait_for_status(&base, 500).await;
    let response = get(&base, "/a", Headers::new(), "").await;
    assert_eq!(response.status, 500);
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn test_silent_upstream_is_504() {
    let private = private_server().await;
    let broker = start_broker().await;
    start_upstream(&broker, &private, None).await;
    let (base, _) = start_client(&broker, "upstream123", Duration::from_millis(300)).await;
    wait_for_status(&base, 200).await;

    let started = tokio::time::Instant::now();
    let response = get(&base, "/hang", Headers::new(), "").await;
    assert_eq!(response.status, 504);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_stream_round_trip_and_teardown() {
    let private = private_server().await;
    let (peer, mut peer_closed) = echo_peer().await;
    let broker = start_broker().await;
    start_upstream(&broker, &private, Some(peer)).await;
    let (base, streams) = start_client(&broker, "upstream123", Duration::from_millis(500)).await;
    wait_for_status(&base, 200).await;

    // Caller closes: the peer connection is closed too
    let (tx, mut rx) = mpsc::channel(16);
    let caller = connect(&streams, tx, Duration::from_secs(5)).await.unwrap();
    let hello = Envelope::new("chat", vec![json!("hello"), json!({"n": 1})]);
    caller.emit(hello.clone());
    match rx.recv().await.unwrap().event {
        TransportEvent::Message(echo) => assert_eq!(echo, hello),
        other => panic!("expected echo, got {:?}", other),
    }
    caller.disconnect();
    assert!(matches!(rx.recv().await.unwrap().event, TransportEvent::Disconnect));
    tokio::time::timeout(Duration::from_secs(5), peer_closed.recv())
        .await
        .expect("peer connection closed");

    // Peer closes: the caller's connection is closed too
    let (tx, mut rx) = mpsc::channel(16);
    let caller = connect(&streams, tx, Duration::from_secs(5)).await.unwrap();
    caller.emit(Envelope::new("chat", vec![json!("again")]));
    assert!(matches!(rx.recv().await.unwrap().event, TransportEvent::Message(_)));
    caller.emit(Envelope::new("bye", vec![]));
    let last = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("caller connection closed")
        .unwrap();
    assert!(matches!(last.event, TransportEvent::Disconnect));
}
