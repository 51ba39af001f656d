//! TLS transport layer: client-facing MITM acceptor, upstream connector,
//! and the SNI peeker used by the transparent listener.

pub mod connector;
pub mod original_dst;
pub mod sni;
pub mod tls;

pub use connector::UpstreamConnector;
pub use original_dst::original_destination;
pub use tls::{build_acceptor, load_webpki_roots, MitmCertResolver};
