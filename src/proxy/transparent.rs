//! Transparent HTTP/HTTPS listeners fed by iptables redirects. Unlike
//! the explicit dispatcher there is no CONNECT handshake:
//! the destination is recovered from the `Host` header (HTTP) or the
//! ClientHello SNI (HTTPS), falling back to `SO_ORIGINAL_DST` for
//! protocols that carry neither.

use super::strip_hop_by_hop;
use crate::domain::DomainMatcher;
use crate::metrics::Metrics;
use crate::mitm::MitmEngine;
use crate::stats::StatsSink;
use crate::transport::original_destination;
use crate::transport::sni::peek_client_hello;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Client;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

type Body = BoxBody<Bytes, std::io::Error>;

fn full(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never: Infallible| match never {}).boxed()
}

#[derive(Clone)]
pub struct TransparentListeners {
    matcher: Arc<DomainMatcher>,
    mitm: MitmEngine,
    mitm_domains: Arc<Vec<String>>,
    stats: Arc<dyn StatsSink>,
    metrics: Arc<Metrics>,
    http_client: Client,
    header_timeout: Duration,
}

impl TransparentListeners {
    pub fn new(
        matcher: Arc<DomainMatcher>,
        mitm: MitmEngine,
        mitm_domains: Vec<String>,
        stats: Arc<dyn StatsSink>,
        metrics: Arc<Metrics>,
        header_timeout: Duration,
    ) -> Self {
        Self {
            matcher,
            mitm,
            mitm_domains: Arc::new(mitm_domains),
            stats,
            metrics,
            http_client: Client::new(),
            header_timeout,
        }
    }

    fn mitm_enabled_for(&self, domain: &str) -> bool {
        self.mitm_domains.iter().any(|d| d == domain || domain.ends_with(&format!(".{d}")))
    }

    /// Accept loop for the transparent HTTP listener (redirected from
    /// port 80). Runs until `addr` can no longer be bound or the task is
    /// cancelled by the caller.
    pub async fn run_http(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, _) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move { this.serve_http_connection(stream).await });
        }
    }

    /// Accept loop for the transparent HTTPS listener (redirected from
    /// port 443).
    pub async fn run_https(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        loop {
            let (stream, _) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move { this.serve_https_connection(stream).await });
        }
    }

    async fn serve_http_connection(self: Arc<Self>, stream: TcpStream) {
        self.stats.on_transparent_http();
        let client_ip = stream.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();

        let io = TokioIo::new(stream);
        let this = self.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let this = this.clone();
            let client_ip = client_ip.clone();
            async move { Ok::<_, Infallible>(this.handle_transparent_http(req, client_ip).await) }
        });

        let serve = server_http1::Builder::new().serve_connection(io, service);
        match tokio::time::timeout(self.header_timeout, serve).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "transparent HTTP connection ended"),
            Err(_) => debug!(timeout = ?self.header_timeout, "transparent HTTP connection exceeded the header timeout"),
        }
    }

    async fn handle_transparent_http(&self, mut req: Request<Incoming>, client_ip: String) -> Response<Body> {
        let host = req
            .headers()
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let domain = match host {
            Some(h) => DomainMatcher::normalize(&h),
            None => {
                warn!("transparent HTTP request missing Host header and no SO_ORIGINAL_DST available in-process");
                return error_response(StatusCode::BAD_REQUEST);
            }
        };

        if self.matcher.is_blocked(&domain) {
            self.stats.on_request(&client_ip, &domain, true, 0, 0);
            self.stats.on_transparent_block();
            return error_response(StatusCode::FORBIDDEN);
        }

        strip_hop_by_hop(req.headers_mut());
        let url = format!("http://{domain}{}", req.uri());
        let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes()).unwrap_or(reqwest::Method::GET);
        let headers = req.headers().clone();
        let (_, incoming) = req.into_parts();
        let body_bytes = match incoming.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "failed to read transparent HTTP request body");
                return error_response(StatusCode::BAD_GATEWAY);
            }
        };
        let bytes_in = body_bytes.len() as u64;

        let mut builder = self.http_client.request(method, &url);
        for (name, value) in headers.iter() {
            builder = builder.header(name.as_str(), value.as_bytes());
        }

        match builder.body(body_bytes).send().await {
            Ok(upstream_response) => {
                let status = StatusCode::from_u16(upstream_response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
                let mut response = Response::builder().status(status);
                for (name, value) in upstream_response.headers().iter() {
                    response = response.header(name.as_str(), value.as_bytes());
                }
                let body = upstream_response.bytes().await.unwrap_or_default();
                let bytes_out = body.len() as u64;
                self.stats.on_request(&client_ip, &domain, false, bytes_in, bytes_out);
                response.body(full(body)).unwrap()
            }
            Err(e) => {
                warn!(domain, error = %e, "transparent HTTP upstream failed");
                error_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    async fn serve_https_connection(self: Arc<Self>, stream: TcpStream) {
        self.stats.on_transparent_tls();
        let client_ip = stream.peer_addr().map(|a| a.ip().to_string()).unwrap_or_default();

        let domain = match peek_client_hello(&stream).await {
            Ok((sni, _peeked)) => sni,
            Err(e) => {
                self.stats.on_sni_missing();
                debug!(
                    error = %e.source,
                    peeked_bytes = e.peeked.len(),
                    "no SNI on transparent HTTPS connection, falling back to SO_ORIGINAL_DST"
                );
                match original_destination(&stream) {
                    Ok(addr) => addr.ip().to_string(),
                    Err(e) => {
                        warn!(error = %e, "transparent HTTPS connection has neither SNI nor SO_ORIGINAL_DST");
                        return;
                    }
                }
            }
        };

        if self.matcher.is_blocked(&domain) {
            self.stats.on_request(&client_ip, &domain, true, 0, 0);
            self.stats.on_transparent_block();
            // No protocol layer to report blocking on; close silently.
            return;
        }

        if self.mitm_enabled_for(&domain) {
            self.stats.on_transparent_mitm();
            self.metrics.mitm_sessions_active.inc();
            if let Err(e) = self.mitm.run_session(stream, domain.clone(), 443, client_ip.clone()).await {
                warn!(domain, error = %e, "transparent mitm session failed");
            }
            self.metrics.mitm_sessions_active.dec();
            return;
        }

        self.run_raw_tunnel(stream, &domain, &client_ip).await;
    }

    async fn run_raw_tunnel(&self, client: TcpStream, domain: &str, client_ip: &str) {
        let upstream = match TcpStream::connect((domain, 443)).await {
            Ok(s) => s,
            Err(e) => {
                warn!(domain, error = %e, "failed to dial upstream for transparent tunnel");
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
}

fn error_response(status: StatusCode) -> Response<Body> {
    Response::builder().status(status).body(full(Bytes::new())).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_carries_requested_status() {
        let resp = error_response(StatusCode::FORBIDDEN);
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }
}
