//! Root CA: generation, persistence, and loading.

pub mod leaf;

use crate::constants::{CA_CERT_BACKDATE, CA_CERT_VALIDITY, CA_EXPIRY_WARNING_WINDOW};
use crate::error::{FpsError, Result};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, Issuer, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls_pemfile::Item;
use std::io::BufReader;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

pub use leaf::LeafCertCache;

/// A loaded or freshly generated root CA: its certificate, key pair, and
/// a few values the management endpoint and MITM loop need cheaply.
pub struct CertAuthority {
    pub cert_der: rustls::pki_types::CertificateDer<'static>,
    pub key_pair: KeyPair,
    pub pem_bytes: Vec<u8>,
    pub sha256_fingerprint: String,
    pub not_after: SystemTime,
    issuer: Issuer<'static, KeyPair>,
}

impl CertAuthority {
    /// Generate a brand-new root CA, valid for `CA_CERT_VALIDITY`
    /// (backdated by `CA_CERT_BACKDATE` to tolerate clock skew).
    pub fn generate(common_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| FpsError::CertGen(e.to_string()))?;

        let mut params =
            CertificateParams::new(Vec::new()).map_err(|e| FpsError::CertGen(e.to_string()))?;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        dn.push(DnType::OrganizationName, "Face Puncher Supreme");
        params.distinguished_name = dn;

        let not_before = SystemTime::now() - CA_CERT_BACKDATE;
        let not_after = not_before + CA_CERT_VALIDITY;
        params.not_before = not_before.into();
        params.not_after = not_after.into();

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| FpsError::CertGen(e.to_string()))?;

        Self::from_parts(cert.pem(), key_pair.serialize_pem())
    }

    /// Persist the CA cert/key to disk as PEM, refusing to overwrite an
    /// existing pair unless the caller already checked.
    pub async fn save(&self, cert_path: &Path, key_path: &Path) -> Result<()> {
        if cert_path.exists() || key_path.exists() {
            return Err(FpsError::CaAlreadyExists(cert_path.display().to_string()));
        }
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(cert_path, &self.pem_bytes).await?;
        fs::write(key_path, self.key_pair.serialize_pem()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(key_path).await?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(key_path, perms).await?;
        }
        Ok(())
    }

    /// Load an existing CA from a cert/key PEM pair on disk.
    pub async fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = fs::read_to_string(cert_path).await?;
        let key_pem = fs::read_to_string(key_path).await?;
        let this = Self::from_parts(cert_pem, key_pem)?;

        if this.not_after < SystemTime::now() + CA_EXPIRY_WARNING_WINDOW {
            warn!(
                path = %cert_path.display(),
                "root CA certificate expires within {} days; regenerate with `fps generate-ca`",
                CA_EXPIRY_WARNING_WINDOW.as_secs() / 86400
            );
        }

        Ok(this)
    }

    fn from_parts(cert_pem: String, key_pem: String) -> Result<Self> {
        let key_pair = KeyPair::from_pem(&key_pem).map_err(|e| FpsError::PrivateKeyParse(e.to_string()))?;
        let issuer_key = KeyPair::from_pem(&key_pem).map_err(|e| FpsError::PrivateKeyParse(e.to_string()))?;
        let der = pem_to_der(&cert_pem)?;
        let fingerprint = sha256_hex(&der);
        let not_after = parse_not_after(&der)?;
        let issuer = Issuer::from_ca_cert_pem(&cert_pem, issuer_key)
            .map_err(|e| FpsError::CertificateParse(e.to_string()))?;

        Ok(Self {
            cert_der: rustls::pki_types::CertificateDer::from(der),
            key_pair,
            pem_bytes: cert_pem.into_bytes(),
            sha256_fingerprint: fingerprint,
            not_after,
            issuer,
        })
    }

    pub fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

fn pem_to_der(pem: &str) -> Result<Vec<u8>> {
    let mut reader = BufReader::new(pem.as_bytes());
    match rustls_pemfile::read_one(&mut reader).map_err(|e| FpsError::CertificateParse(e.to_string()))? {
        Some(Item::X509Certificate(der)) => Ok(der.to_vec()),
        _ => Err(FpsError::NotACaCertificate),
    }
}

fn parse_not_after(der: &[u8]) -> Result<SystemTime> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| FpsError::CertificateParse(e.to_string()))?;
    let unix_secs = cert.validity().not_after.timestamp();
    Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(unix_secs.max(0) as u64))
}

fn sha256_hex(der: &[u8]) -> String {
    use ring::digest;
    let digest = digest::digest(&digest::SHA256, der);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
