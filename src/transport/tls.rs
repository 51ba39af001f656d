//! Client-facing TLS acceptor for the MITM listener.
//!
//! Unlike a conventional TLS server, which serves one fixed certificate,
//! the acceptor here resolves a different leaf certificate per
//! connection based on the SNI name the client hello carries, signing it
//! on the fly (and caching it) against the local root CA.

use crate::ca::{CertAuthority, LeafCertCache};
use crate::error::{FpsError, Result};
use rustls::pki_types::PrivateKeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::warn;

/// Resolves a `CertifiedKey` for whatever SNI name the client presents,
/// generating and caching a leaf certificate signed by `ca` as needed.
/// Grounded on the same "load-or-generate" shape as a file-backed
/// acceptor, but keyed by domain instead of a single configured path.
pub struct MitmCertResolver {
    ca: Arc<CertAuthority>,
    leaf_cache: Arc<LeafCertCache>,
}

impl MitmCertResolver {
    pub fn new(ca: Arc<CertAuthority>, leaf_cache: Arc<LeafCertCache>) -> Self {
        Self { ca, leaf_cache }
    }
}

impl std::fmt::Debug for MitmCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for MitmCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let domain = client_hello.server_name()?;
        let leaf = match self.leaf_cache.get_cert(domain, &self.ca) {
            Ok(leaf) => leaf,
            Err(e) => {
                warn!(domain, error = %e, "failed to generate leaf certificate");
                return None;
            }
        };

        let key_der = PrivateKeyDer::Pkcs8(leaf.key_der.clone_key());
        let signing_key = match rustls::crypto::aws_lc_rs::sign::any_supported_type(&key_der) {
            Ok(key) => key,
            Err(e) => {
                warn!(domain, error = %e, "leaf private key is not a supported signing key");
                return None;
            }
        };

        Some(Arc::new(CertifiedKey::new(leaf.cert_chain.clone(), signing_key)))
    }
}

/// Build the `TlsAcceptor` used by the MITM listener: no client-cert
/// requirement (the proxy never needs to authenticate browsers), SNI
/// resolved dynamically through `MitmCertResolver`.
pub fn build_acceptor(
    ca: Arc<CertAuthority>,
    leaf_cache: Arc<LeafCertCache>,
) -> Result<TlsAcceptor> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let resolver = Arc::new(MitmCertResolver::new(ca, leaf_cache));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load the CA bundle rustls uses to validate the upstream TLS
/// connection when the proxy originates its own TLS to the real origin.
pub fn load_webpki_roots() -> Result<rustls::RootCertStore> {
    let mut store = rustls::RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if store.is_empty() {
        return Err(FpsError::TlsConfig("no webpki roots loaded".to_string()));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_acceptor_succeeds_with_fresh_ca() {
        let ca = Arc::new(CertAuthority::generate("Test CA").unwrap());
        let cache = Arc::new(LeafCertCache::new());
        assert!(build_acceptor(ca, cache).is_ok());
    }

    #[test]
    fn load_webpki_roots_is_non_empty() {
        assert!(load_webpki_roots().unwrap().len() > 0);
    }
}
