//! End-to-end scenarios exercising the explicit dispatcher over real TCP
//! loopback connections: a live listener accepts real client sockets
//! instead of calling handler functions directly.

use face_puncher_supreme::ca::{CertAuthority, LeafCertCache};
use face_puncher_supreme::domain::DomainMatcher;
use face_puncher_supreme::management;
use face_puncher_supreme::metrics::Metrics;
use face_puncher_supreme::mitm::MitmEngine;
use face_puncher_supreme::plugins::PluginPipeline;
use face_puncher_supreme::proxy::dispatcher::Dispatcher;
use face_puncher_supreme::stats::{NoopStatsSink, StatsSink};
use face_puncher_supreme::transport::UpstreamConnector;

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn build_dispatcher(blocklist: &[&str]) -> Arc<Dispatcher> {
    let matcher = Arc::new(DomainMatcher::new());
    matcher.set_blocklist(blocklist.iter().map(|s| s.to_string()).collect());

    let connector = UpstreamConnector::new().unwrap();
    let leaf_cache = Arc::new(LeafCertCache::new());
    let ca = Arc::new(CertAuthority::generate("test CA").unwrap());
    let pipeline = Arc::new(PluginPipeline::build(&[], &[]).unwrap());
    let stats: Arc<dyn StatsSink> = Arc::new(NoopStatsSink);
    let metrics = Arc::new(Metrics::new().unwrap());

    let mitm = MitmEngine::new(
        ca.clone(),
        leaf_cache,
        connector,
        pipeline,
        stats.clone(),
        Duration::from_secs(5),
        Duration::from_secs(5),
    )
    .unwrap();

    let management_router = management::router(matcher.clone(), metrics.clone(), Some(ca), None);

    Arc::new(Dispatcher::new(
        matcher,
        mitm,
        Vec::new(),
        "/fps/".to_string(),
        management_router,
        stats,
        metrics,
        Duration::from_secs(5),
    ))
}

async fn connect_and_exchange(addr: std::net::SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    stream.shutdown().await.ok();

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).to_string()
}

/// S3: a CONNECT request for a blocked domain gets `403 Forbidden` instead
/// of being tunneled or upgraded.
#[tokio::test]
async fn s3_connect_to_blocked_domain_is_forbidden() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = build_dispatcher(&["ads.example.com"]).await;

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        dispatcher.serve(stream, peer.ip().to_string()).await;
    });

    let response = connect_and_exchange(
        addr,
        b"CONNECT ads.example.com:443 HTTP/1.1\r\nHost: ads.example.com:443\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 403"), "unexpected response: {response}");
}

/// A CONNECT request for a domain that isn't blocked gets tunneled (no
/// MITM domains configured here, so it falls through to the raw relay,
/// which will fail to dial a nonexistent domain but must not 403).
#[tokio::test]
async fn connect_to_allowed_domain_is_not_blocked() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = build_dispatcher(&["ads.example.com"]).await;

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        dispatcher.serve(stream, peer.ip().to_string()).await;
    });

    let response = connect_and_exchange(
        addr,
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
}

/// The management router is reachable through the same listener, with the
/// prefix stripped before being handed to axum.
#[tokio::test]
async fn management_heartbeat_is_reachable_through_the_proxy_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dispatcher = build_dispatcher(&[]).await;

    tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        dispatcher.serve(stream, peer.ip().to_string()).await;
    });

    let response = connect_and_exchange(
        addr,
        b"GET /fps/heartbeat HTTP/1.1\r\nHost: proxy.local\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    assert!(response.contains("\"status\":\"ok\""), "unexpected body: {response}");
}
