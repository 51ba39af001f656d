//! Explicit proxy dispatcher: the single listener socket
//! that serves both absolute-form HTTP proxy requests and CONNECT
//! tunnels.

use super::strip_hop_by_hop;
use crate::domain::DomainMatcher;
use crate::metrics::Metrics;
use crate::mitm::MitmEngine;
use crate::stats::StatsSink;

use axum::Router;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Client;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tower::ServiceExt;
use tracing::{debug, warn};

type Body = BoxBody<Bytes, std::io::Error>;

fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never: Infallible| match never {}).boxed()
}

fn empty() -> Body {
    Empty::new().map_err(|never: Infallible| match never {}).boxed()
}

fn plain_text_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(full(message))
        .unwrap()
}

/// Shared state for the explicit dispatcher. Cloned into every accepted
/// connection's service closure.
#[derive(Clone)]
pub struct Dispatcher {
    matcher: Arc<DomainMatcher>,
    mitm: MitmEngine,
    mitm_domains: Arc<Vec<String>>,
    management_prefix: String,
    management_router: Router,
    stats: Arc<dyn StatsSink>,
    metrics: Arc<Metrics>,
    http_client: Client,
    header_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        matcher: Arc<DomainMatcher>,
        mitm: MitmEngine,
        mitm_domains: Vec<String>,
        management_prefix: String,
        management_router: Router,
        stats: Arc<dyn StatsSink>,
        metrics: Arc<Metrics>,
        header_timeout: Duration,
    ) -> Self {
        Self {
            matcher,
            mitm,
            mitm_domains: Arc::new(mitm_domains),
            management_prefix,
            management_router,
            stats,
            metrics,
            http_client: Client::new(),
            header_timeout,
        }
    }

    fn mitm_enabled_for(&self, domain: &str) -> bool {
        self.mitm_domains.iter().any(|d| d == domain || domain.ends_with(&format!(".{d}")))
    }

    /// Serve one accepted TCP connection. Runs until the client closes
    /// the socket or a CONNECT request hands the socket off to the MITM
    /// engine or a raw tunnel.
    pub async fn serve(self: Arc<Self>, stream: TcpStream, client_ip: String) {
        self.metrics.active_connections.inc();

        let io = TokioIo::new(stream);
        let dispatcher = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let dispatcher = dispatcher.clone();
            let client_ip = client_ip.clone();
            async move { Ok::<_, Infallible>(dispatcher.dispatch(req, client_ip).await) }
        });

        let serve = server_http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades();

        match tokio::time::timeout(self.header_timeout, serve).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "explicit proxy connection ended"),
            Err(_) => debug!(timeout = ?self.header_timeout, "explicit proxy connection exceeded the header timeout"),
        }

        self.metrics.active_connections.dec();
    }

    async fn dispatch(&self, req: Request<Incoming>, client_ip: String) -> Response<Body> {
        if req.uri().path().starts_with(&self.management_prefix) {
            return self.delegate_to_management(req).await;
        }

        if req.method() == Method::CONNECT {
            return self.handle_connect(req, client_ip).await;
        }

        self.handle_forward(req, client_ip).await
    }

    /// Adapt one request onto the axum management router, which owns
    /// `<prefix>/heartbeat`, `<prefix>/stats`, `<prefix>/ca.pem`, and
    /// `<prefix>/config/reload`. The router itself is mounted
    /// at the bare paths (`/heartbeat`, ...), so the prefix is stripped
    /// from the request before handing it off.
    async fn delegate_to_management(&self, mut req: Request<Incoming>) -> Response<Body> {
        let stripped = req
            .uri()
            .path()
            .strip_prefix(&self.management_prefix)
            .unwrap_or("");
        let stripped = match stripped {
            "" => "/".to_string(),
            s if s.starts_with('/') => s.to_string(),
            s => format!("/{s}"),
        };
        let new_path_and_query = match req.uri().query() {
            Some(q) => format!("{stripped}?{q}"),
            None => stripped,
        };
        let mut parts = req.uri().clone().into_parts();
        parts.path_and_query = match new_path_and_query.parse() {
            Ok(pq) => Some(pq),
            Err(_) => return plain_text_response(StatusCode::BAD_REQUEST, "malformed management path"),
        };
        match hyper::Uri::from_parts(parts) {
            Ok(uri) => *req.uri_mut() = uri,
            Err(_) => return plain_text_response(StatusCode::BAD_REQUEST, "malformed management path"),
        }

        let axum_req = req.map(axum::body::Body::new);
        match self.management_router.clone().oneshot(axum_req).await {
            Ok(resp) => resp.map(|b| b.map_err(std::io::Error::other).boxed()),
            Err(never) => match never {},
        }
    }

    /// CONNECT handling: block, MITM, or raw tunnel.
    async fn handle_connect(&self, req: Request<Incoming>, client_ip: String) -> Response<Body> {
        let authority = req.uri().authority().map(|a| a.to_string()).unwrap_or_default();
        let (domain, port) = split_connect_authority(&authority);

        if domain.is_empty() {
            return plain_text_response(StatusCode::BAD_REQUEST, "missing CONNECT target");
        }

        if self.matcher.is_blocked(&domain) {
            self.stats.on_request(&client_ip, &domain, true, 0, 0);
            debug!(domain, "CONNECT blocked");
            return plain_text_response(StatusCode::FORBIDDEN, "blocked");
        }

        let use_mitm = self.mitm_enabled_for(&domain);
        let this = self.clone_for_upgrade();

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let stream = upgraded_to_tcp(upgraded).await;
                    if use_mitm {
                        this.metrics.mitm_sessions_active.inc();
                        if let Err(e) = this.mitm.run_session(stream, domain.clone(), port, client_ip.clone()).await {
                            warn!(domain, error = %e, "mitm session failed");
                        }
                        this.metrics.mitm_sessions_active.dec();
                    } else {
                        this.run_raw_tunnel(stream, &domain, port, &client_ip).await;
                    }
                }
                Err(e) => warn!(error = %e, "CONNECT upgrade failed"),
            }
        });

        Response::builder()
            .status(StatusCode::OK)
            .body(empty())
            .unwrap()
    }

    fn clone_for_upgrade(&self) -> Arc<Self> {
        Arc::new(self.clone())
    }

    async fn run_raw_tunnel(&self, client: TcpStream, domain: &str, port: u16, client_ip: &str) {
        let upstream = match TcpStream::connect((domain, port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(domain, error = %e, "failed to dial upstream for raw tunnel");
                return;
            }
        };

        let (mut client_r, mut client_w) = tokio::io::split(client);
        let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

        let c2u = async {
            let n = tokio::io::copy(&mut client_r, &mut upstream_w).await.unwrap_or(0);
            let _ = upstream_w.shutdown().await;
            n
        };
        let u2c = async {
            let n = tokio::io::copy(&mut upstream_r, &mut client_w).await.unwrap_or(0);
            let _ = client_w.shutdown().await;
            n
        };

        let (bytes_in, bytes_out) = tokio::join!(c2u, u2c);
        self.stats.on_tunnel_close(client_ip, bytes_in, bytes_out);
    }

    /// Absolute-form HTTP proxy forwarding.
    async fn handle_forward(&self, mut req: Request<Incoming>, client_ip: String) -> Response<Body> {
        let Some(uri_host) = req.uri().host().map(str::to_string) else {
            return plain_text_response(StatusCode::BAD_REQUEST, "missing Host in absolute-form request");
        };

        if self.matcher.is_blocked(&uri_host) {
            self.stats.on_request(&client_ip, &uri_host, true, 0, 0);
            return plain_text_response(StatusCode::FORBIDDEN, "blocked");
        }

        strip_hop_by_hop(req.headers_mut());

        let url = req.uri().to_string();
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
        let headers = req.headers().clone();
        let (_, incoming) = req.into_parts();
        let body_bytes = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read request body for forwarding");
                return plain_text_response(StatusCode::BAD_GATEWAY, "upstream error");
            }
        };
        let bytes_in = body_bytes.len() as u64;

        let mut builder = self.http_client.request(method, &url);
        for (name, value) in headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        match builder.body(body_bytes).send().await {
            Ok(upstream_response) => {
                let status = StatusCode::from_u16(upstream_response.status().as_u16())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let mut response = Response::builder().status(status);
                for (name, value) in upstream_response.headers().iter() {
                    response = response.header(name.as_str(), value.as_bytes());
                }
                let body = upstream_response.bytes().await.unwrap_or_default();
                let bytes_out = body.len() as u64;
                self.stats.on_request(&client_ip, &uri_host, false, bytes_in, bytes_out);
                response.body(full(body)).unwrap()
            }
            Err(e) => {
                warn!(domain = %uri_host, error = %e, "upstream forward failed");
                plain_text_response(StatusCode::BAD_GATEWAY, "upstream error")
            }
        }
    }
}

/// Split a CONNECT authority (`host:port`, per RFC 7231) into its host and
/// port, defaulting to 443 when the authority carries no port at all.
fn split_connect_authority(authority: &str) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (authority.to_string(), 443),
        },
        None => (authority.to_string(), 443),
    }
}

async fn upgraded_to_tcp(upgraded: Upgraded) -> TcpStream {
    // Hyper hands us an `Upgraded` wrapping the original duplex I/O; the
    // raw tunnel and MITM engine both just need a byte stream, so we
    // relay through a loopback-free in-process pipe is unnecessary here
    // — `TokioIo::new` round trips it back to the same socket.
    let parts = upgraded.downcast::<TokioIo<TcpStream>>();
    match parts {
        Ok(parts) => parts.io.into_inner(),
        Err(_) => unreachable!("CONNECT upgrade always wraps the original TokioIo<TcpStream>"),
    }
}
