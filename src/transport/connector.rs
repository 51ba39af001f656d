//! Upstream TLS connector used to originate a fresh TLS session to the
//! real origin server once the proxy has decrypted the client side.

use crate::error::{FpsError, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsConnector};

/// Builds one `rustls::ClientConfig` at startup (loading the webpki
/// root store is not free) and reuses it for every upstream connection.
#[derive(Clone)]
pub struct UpstreamConnector {
    connector: TlsConnector,
}

impl UpstreamConnector {
    pub fn new() -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
        let roots = super::tls::load_webpki_roots()?;

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Open a TCP connection to `host:port` and perform a TLS handshake
    /// for `sni_name`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        sni_name: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| FpsError::UpstreamConnect(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        let server_name = ServerName::try_from(sni_name.to_string())
            .map_err(|e| FpsError::UpstreamTls(e.to_string()))?;

        self.connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| FpsError::UpstreamTls(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_without_error() {
        assert!(UpstreamConnector::new().is_ok());
    }
}
