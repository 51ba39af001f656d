//! Leaf certificate cache: one CA-signed certificate per intercepted
//! domain, generated on demand and renewed before expiry.

use super::CertAuthority;
use crate::constants::{LEAF_CERT_BACKDATE, LEAF_CERT_RENEWAL_THRESHOLD, LEAF_CERT_VALIDITY};
use crate::error::{FpsError, Result};
use parking_lot::RwLock;
use rcgen::{CertificateParams, Ia5String, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// A signed leaf certificate plus the raw key material rustls needs to
/// present it.
#[derive(Clone)]
pub struct LeafCert {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub not_after: SystemTime,
}

/// Per-domain leaf certificate cache. Reads take a shared lock to clone
/// an `Arc<LeafCert>`; a cache miss or near-expiry entry upgrades to a
/// write lock and re-checks under it before generating, so concurrent
/// handshakes for the same domain never race each other into signing
/// the certificate twice.
pub struct LeafCertCache {
    entries: RwLock<HashMap<String, Arc<LeafCert>>>,
}

impl Default for LeafCertCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LeafCertCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Return a valid leaf certificate for `domain`, generating (or
    /// regenerating, if the cached one is within `LEAF_CERT_RENEWAL_THRESHOLD`
    /// of expiry) one signed by `ca` as needed.
    pub fn get_cert(&self, domain: &str, ca: &CertAuthority) -> Result<Arc<LeafCert>> {
        if let Some(cert) = self.entries.read().get(domain) {
            if !needs_renewal(cert.not_after) {
                return Ok(cert.clone());
            }
        }

        let mut write = self.entries.write();
        // Re-check: another thread may have refreshed this entry while we
        // were waiting for the write lock.
        if let Some(cert) = write.get(domain) {
            if !needs_renewal(cert.not_after) {
                return Ok(cert.clone());
            }
        }

        let fresh = Arc::new(generate_leaf(domain, ca)?);
        write.insert(domain.to_string(), fresh.clone());
        Ok(fresh)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn needs_renewal(not_after: SystemTime) -> bool {
    match not_after.duration_since(SystemTime::now()) {
        Ok(remaining) => remaining < LEAF_CERT_RENEWAL_THRESHOLD,
        Err(_) => true, // already expired
    }
}

fn generate_leaf(domain: &str, ca: &CertAuthority) -> Result<LeafCert> {
    let mut params = if let Ok(ip) = domain.parse::<IpAddr>() {
        let mut params =
            CertificateParams::new(Vec::new()).map_err(|e| FpsError::CertGen(e.to_string()))?;
        params.subject_alt_names.push(SanType::IpAddress(ip));
        params
    } else {
        CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| FpsError::CertGen(e.to_string()))?
    };

    let not_before = SystemTime::now() - LEAF_CERT_BACKDATE;
    let not_after = not_before + LEAF_CERT_VALIDITY;
    params.not_before = not_before.into();
    params.not_after = not_after.into();
    params.subject_alt_names.push(SanType::DnsName(
        Ia5String::try_from(domain.to_string()).map_err(|e| FpsError::CertGen(e.to_string()))?,
    ));
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = KeyPair::generate().map_err(|e| FpsError::CertGen(e.to_string()))?;
    let cert = params
        .signed_by(&key_pair, ca.issuer())
        .map_err(|e| FpsError::CertGen(e.to_string()))?;

    let mut chain = vec![CertificateDer::from(cert.der().to_vec())];
    chain.push(ca.cert_der.clone());

    Ok(LeafCert {
        cert_chain: chain,
        key_der: PrivatePkcs8KeyDer::from(key_pair.serialize_der()),
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_cert_generates_and_caches() {
        let ca = CertAuthority::generate("Test CA").unwrap();
        let cache = LeafCertCache::new();
        let a = cache.get_cert("example.com", &ca).unwrap();
        let b = cache.get_cert("example.com", &ca).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn get_cert_is_per_domain() {
        let ca = CertAuthority::generate("Test CA").unwrap();
        let cache = LeafCertCache::new();
        cache.get_cert("a.example.com", &ca).unwrap();
        cache.get_cert("b.example.com", &ca).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn needs_renewal_true_once_past_threshold() {
        assert!(!needs_renewal(SystemTime::now() + Duration::from_secs(3600 * 2)));
        assert!(needs_renewal(SystemTime::now() + Duration::from_secs(60)));
        assert!(needs_renewal(SystemTime::now() - Duration::from_secs(1)));
    }
}
