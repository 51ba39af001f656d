//! TLS interception engine. For one intercepted CONNECT or
//! transparent-HTTPS connection: complete a client-facing TLS handshake
//! with a freshly minted leaf certificate, dial and handshake with the
//! real upstream, then run the HTTP/1.1 proxy loop until either
//! side closes.

use crate::ca::{CertAuthority, LeafCertCache};
use crate::constants::MAX_MODIFIABLE_BODY_BYTES;
use crate::error::{FpsError, Result};
use crate::plugins::{is_modifiable_content_type, FilterContext, PluginPipeline};
use crate::proxy::strip_hop_by_hop;
use crate::stats::StatsSink;
use crate::transport::{build_acceptor, UpstreamConnector};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

type Body = BoxBody<Bytes, std::io::Error>;

fn full_body(bytes: Bytes) -> Body {
    Full::new(bytes).map_err(|never: Infallible| match never {}).boxed()
}

fn empty_body() -> Body {
    Empty::new().map_err(|never: Infallible| match never {}).boxed()
}

fn streaming_body(incoming: Incoming) -> Body {
    incoming.map_err(std::io::Error::other).boxed()
}

/// Engine state shared across every MITM session: CA, leaf cert cache,
/// client-facing TLS acceptor, upstream connector, and the composed
/// plugin pipeline. Cheap to clone (everything inside is `Arc`).
#[derive(Clone)]
pub struct MitmEngine {
    acceptor: TlsAcceptor,
    connector: UpstreamConnector,
    pipeline: Arc<PluginPipeline>,
    stats: Arc<dyn StatsSink>,
    connect_timeout: Duration,
    header_timeout: Duration,
}

impl MitmEngine {
    pub fn new(
        ca: Arc<CertAuthority>,
        leaf_cache: Arc<LeafCertCache>,
        connector: UpstreamConnector,
        pipeline: Arc<PluginPipeline>,
        stats: Arc<dyn StatsSink>,
        connect_timeout: Duration,
        header_timeout: Duration,
    ) -> Result<Self> {
        let acceptor = build_acceptor(ca, leaf_cache)?;
        Ok(Self {
            acceptor,
            connector,
            pipeline,
            stats,
            connect_timeout,
            header_timeout,
        })
    }

    /// Run one intercepted session to completion. Takes ownership of the
    /// raw client socket (already identified as belonging to `domain`,
    /// whether via CONNECT's Host or a peeked SNI). Closes both sockets
    /// on return, in all cases.
    pub async fn run_session(
        &self,
        client_tcp: TcpStream,
        domain: String,
        port: u16,
        client_ip: String,
    ) -> Result<()> {
        let client_tls = self
            .acceptor
            .accept(client_tcp)
            .await
            .map_err(|e| FpsError::TlsHandshakeFailure(e.to_string()))?;

        let upstream_tls = tokio::time::timeout(
            self.connect_timeout,
            self.connector.connect(&domain, port, &domain),
        )
        .await
        .map_err(|_| FpsError::UpstreamConnect(format!("connect to {domain} timed out")))??;

        let (sender, upstream_conn) = hyper::client::conn::http1::handshake(TokioIo::new(upstream_tls))
            .await
            .map_err(|e| FpsError::UpstreamProtocol(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = upstream_conn.await {
                debug!(error = %e, "upstream connection task ended");
            }
        });
        let sender = Arc::new(Mutex::new(sender));

        let session = Arc::new(SessionContext {
            domain,
            client_ip,
            pipeline: self.pipeline.clone(),
            stats: self.stats.clone(),
            sender,
        });

        let io = TokioIo::new(client_tls);
        let service = service_fn(move |req: Request<Incoming>| {
            let session = session.clone();
            async move { Ok::<_, Infallible>(handle_one_request(session, req).await) }
        });

        let serve = server_http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades();

        match tokio::time::timeout(self.header_timeout, serve).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let msg = e.to_string();
                if msg.contains("connection closed") || msg.contains("connection reset") || msg.contains("broken pipe") {
                    debug!(error = %msg, "mitm session ended on client disconnect");
                } else {
                    warn!(error = %msg, "mitm session ended with error");
                }
            }
            Err(_) => {
                debug!(timeout = ?self.header_timeout, "mitm session exceeded the header timeout");
            }
        }

        Ok(())
    }
}

struct SessionContext {
    domain: String,
    client_ip: String,
    pipeline: Arc<PluginPipeline>,
    stats: Arc<dyn StatsSink>,
    sender: Arc<Mutex<SendRequest<Body>>>,
}

/// One HTTP/1.1 request/response cycle inside an intercepted session
///. hyper's h1 server connection already provides the
/// outer "repeat until either side closes" loop; this is the per-call
/// body.
async fn handle_one_request(session: Arc<SessionContext>, mut req: Request<Incoming>) -> Response<Body> {
    strip_hop_by_hop(req.headers_mut());

    // A non-empty pipeline means some plugin may want an uncompressed
    // body; force it upstream regardless of which domain the plugin
    // actually scopes to (cheap, and avoids a second round trip).
    if !session.pipeline.is_empty() {
        req.headers_mut().remove(http::header::ACCEPT_ENCODING);
    }

    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_headers = req.headers().clone();
    let req = req.map(|incoming| streaming_body(incoming));

    let mut sender = session.sender.lock().await;
    let upstream_result = sender.send_request(req).await;
    drop(sender);

    let mut response = match upstream_result {
        Ok(resp) => resp,
        Err(e) => {
            warn!(domain = %session.domain, error = %e, "upstream request failed");
            return error_response(hyper::StatusCode::BAD_GATEWAY);
        }
    };

    strip_hop_by_hop(response.headers_mut());
    session.stats.on_mitm_request(&session.client_ip, &session.domain);

    let content_type = response
        .headers()
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let status = response.status();
    let response_headers = response.headers().clone();

    // A Content-Length over the cap lets us skip buffering entirely and
    // stream the original response through untouched. Without a known length (chunked transfer-encoding) we attempt
    // to buffer and treat exceeding the cap mid-stream as an upstream
    // protocol error rather than trying to recover the consumed prefix.
    let content_length: Option<usize> = response_headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let within_cap = content_length.map(|len| len <= MAX_MODIFIABLE_BODY_BYTES).unwrap_or(true);

    if !session.pipeline.is_empty() && is_modifiable_content_type(&content_type) && within_cap {
        let (parts, incoming) = response.into_parts();
        match Limited::new(incoming, MAX_MODIFIABLE_BODY_BYTES).collect().await {
            Ok(collected) => {
                let body = collected.to_bytes();
                let ctx = FilterContext {
                    domain: &session.domain,
                    method: &method,
                    uri: &uri,
                    request_headers: &request_headers,
                    status,
                    response_headers: &response_headers,
                };
                return match session.pipeline.run(&ctx, session.stats.as_ref(), body).await {
                    Ok(new_body) => {
                        let mut parts = parts;
                        parts.headers.remove(http::header::TRANSFER_ENCODING);
                        parts
                            .headers
                            .insert(http::header::CONTENT_LENGTH, new_body.len().into());
                        Response::from_parts(parts, full_body(new_body))
                    }
                    Err(e) => {
                        warn!(domain = %session.domain, error = %e, "plugin pipeline failed, aborting session");
                        error_response(hyper::StatusCode::INTERNAL_SERVER_ERROR)
                    }
                };
            }
            Err(e) => {
                warn!(domain = %session.domain, error = %e, "failed to buffer response body for plugin pipeline");
                return error_response(hyper::StatusCode::BAD_GATEWAY);
            }
        }
    }

    response.map(streaming_body)
}

fn error_response(status: hyper::StatusCode) -> Response<Body> {
    Response::builder().status(status).body(empty_body()).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::stats::PrometheusStatsSink;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn full_body_round_trips_bytes() {
        let body = full_body(Bytes::from_static(b"hello"));
        assert!(!body.is_end_stream());
    }

    /// S4: a GET through `handle_one_request` is forwarded to the upstream
    /// connection unmodified, the response comes back correctly framed,
    /// and the per-domain MITM counter advances by one. The client-facing
    /// and upstream TLS legs aren't exercised here (those are `rustls`'s
    /// responsibility, already covered by the acceptor/connector units);
    /// this drives the plaintext proxy loop exactly as `run_session` wires
    /// it, over real sockets instead of a hardcoded upstream dial.
    #[tokio::test]
    async fn s4_get_request_round_trips_with_correct_framing_and_counts() {
        let (upstream_client_io, upstream_server_io) = tokio::io::duplex(8192);

        let (sender, upstream_conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(upstream_client_io))
                .await
                .unwrap();
        tokio::spawn(async move {
            let _ = upstream_conn.await;
        });
        tokio::spawn(async move {
            let service = service_fn(|_req: Request<Incoming>| async {
                Ok::<_, Infallible>(
                    Response::builder()
                        .status(hyper::StatusCode::OK)
                        .header(http::header::CONTENT_TYPE, "text/plain")
                        .body(full_body(Bytes::from_static(b"hello")))
                        .unwrap(),
                )
            });
            let _ = server_http1::Builder::new()
                .serve_connection(TokioIo::new(upstream_server_io), service)
                .await;
        });

        let metrics = Arc::new(Metrics::new().unwrap());
        let stats: Arc<dyn StatsSink> = Arc::new(PrometheusStatsSink::new(metrics.clone()));
        let session = Arc::new(SessionContext {
            domain: "x.test".to_string(),
            client_ip: "127.0.0.1".to_string(),
            pipeline: Arc::new(PluginPipeline::build(&[], &[]).unwrap()),
            stats,
            sender: Arc::new(Mutex::new(sender)),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(move |req: Request<Incoming>| {
                let session = session.clone();
                async move { Ok::<_, Infallible>(handle_one_request(session, req).await) }
            });
            let _ = server_http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        client.shutdown().await.ok();

        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf)).await;
        let response = String::from_utf8_lossy(&buf);

        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
        assert!(response.contains("content-length: 5"), "unexpected response: {response}");
        assert!(response.ends_with("hello"), "unexpected response: {response}");

        let exported = metrics.export().unwrap();
        assert!(exported.contains("fps_mitm_requests_total 1"), "counter did not advance: {exported}");
    }
}
