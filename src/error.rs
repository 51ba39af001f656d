//! Unified error type for Face Puncher Supreme
//!
//! Every fallible operation in the core returns `Result<T>` using this
//! error enum. Client protocol errors surface as 4xx, upstream errors as
//! 502 (or a silent close on CONNECT/transparent TLS), client disconnects
//! terminate the handler cleanly, and config errors never mutate state.

use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FpsError>;

#[derive(Debug, Clone, Error)]
pub enum FpsError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoArc(Arc<std::io::Error>),

    // Configuration
    #[error("invalid listen address: {0}")]
    InvalidBindAddress(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(String),
    #[error("configuration is invalid: {0}")]
    ConfigInvalid(String),

    // Domain matcher / blocklist
    #[error("failed to fetch blocklist {url}: {reason}")]
    ListFetch { url: String, reason: String },
    #[error("blocklist parse error: {0}")]
    ListParse(String),

    // CA / certificates
    #[error("CA certificate/key already exists at {0} (use --force to overwrite)")]
    CaAlreadyExists(String),
    #[error("failed to generate certificate: {0}")]
    CertGen(String),
    #[error("certificate is not a valid CA certificate")]
    NotACaCertificate,
    #[error("failed to parse certificate: {0}")]
    CertificateParse(String),
    #[error("failed to parse private key: {0}")]
    PrivateKeyParse(String),
    #[error("no certificate found in file")]
    NoCertificate,
    #[error("no private key found in file")]
    NoPrivateKey,

    // TLS
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    #[error("client TLS handshake failed: {0}")]
    TlsHandshakeFailure(String),
    #[error("upstream TLS handshake failed: {0}")]
    UpstreamTls(String),

    // SNI peeking
    #[error("connection closed before TLS record header was read")]
    SniTruncated,
    #[error("record is not a TLS handshake record")]
    NotTls,
    #[error("ClientHello did not contain a server_name extension")]
    SniMissing,
    #[error("malformed ClientHello: {0}")]
    SniMalformed(String),

    // HTTP / proxy loop
    #[error("malformed HTTP message: {0}")]
    ClientProtocol(String),
    #[error("missing Host in absolute-form request")]
    MissingHost,
    #[error("failed to connect upstream: {0}")]
    UpstreamConnect(String),
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("client disconnected: {0}")]
    ClientDisconnect(String),

    // Plugins
    #[error("plugin {0} is not registered")]
    UnknownPlugin(String),
    #[error("invalid plugin configuration for {plugin}: {reason}")]
    InvalidPluginConfig { plugin: String, reason: String },
    #[error("plugin {plugin} failed: {reason}")]
    FilterError { plugin: String, reason: String },

    #[error("operation timed out")]
    Timeout,
    #[error("server is shutting down")]
    ServerShutdown,
    #[error("unsupported on this platform: {0}")]
    Unsupported(String),
}

impl From<std::io::Error> for FpsError {
    fn from(err: std::io::Error) -> Self {
        FpsError::IoArc(Arc::new(err))
    }
}

/// An SNI peek that failed partway through still read some bytes off the
/// wire; since `TcpStream::peek` never consumes them they remain on the
/// socket for the next reader, but callers that want to log or replay
/// what was seen need them attached to the error itself rather than lost
/// on the `Err` arm.
#[derive(Debug, Clone, Error)]
#[error("{source}")]
pub struct SniPeekError {
    pub source: FpsError,
    pub peeked: Vec<u8>,
}

impl FpsError {
    /// True for errors that must never be treated as fatal: resets,
    /// broken pipes, and writes/reads on an already-closed socket.
    pub fn is_client_disconnect(err: &std::io::Error) -> bool {
        use std::io::ErrorKind::*;
        matches!(
            err.kind(),
            ConnectionReset | BrokenPipe | ConnectionAborted | NotConnected
        )
    }

    /// Classify a raw IO error the way the proxy loop needs to: disconnects
    /// are downgraded to `ClientDisconnect` (logged at debug, not error).
    pub fn from_io_classified(err: std::io::Error) -> Self {
        if Self::is_client_disconnect(&err) {
            FpsError::ClientDisconnect(err.to_string())
        } else {
            FpsError::IoArc(Arc::new(err))
        }
    }
}
