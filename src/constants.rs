//! Shared constants for the proxy core.

use std::time::Duration;

/// Hop-by-hop headers stripped from every forwarded request/response.
pub const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Response bodies larger than this are streamed through untouched;
/// the plugin pipeline is bypassed.
pub const MAX_MODIFIABLE_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Leaf certificates are reissued once their remaining lifetime drops
/// below this threshold.
pub const LEAF_CERT_RENEWAL_THRESHOLD: Duration = Duration::from_secs(60 * 60);

/// Leaf certificate validity window.
pub const LEAF_CERT_VALIDITY: Duration = Duration::from_secs(24 * 60 * 60);

/// Leaf certificates are backdated by this much to tolerate clock skew
/// between proxy and client.
pub const LEAF_CERT_BACKDATE: Duration = Duration::from_secs(5 * 60);

/// CA certificate validity window.
pub const CA_CERT_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// CA certificates are backdated by this much to tolerate clock skew.
pub const CA_CERT_BACKDATE: Duration = Duration::from_secs(60 * 60);

/// Startup warning threshold: warn if the loaded CA expires within this
/// window.
pub const CA_EXPIRY_WARNING_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Bound on a single peeked TLS record payload.
pub const MAX_TLS_RECORD_PAYLOAD: usize = 16 * 1024;

/// Default timeout budget for a single blocklist fetch.
pub const LIST_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default management path prefix.
pub const DEFAULT_MANAGEMENT_PREFIX: &str = "/fps/";

/// Reserved hostnames that are never treated as blockable domains.
pub const RESERVED_LOCAL_NAMES: &[&str] =
    &["localhost", "localhost.localdomain", "local", "broadcasthost"];

/// Sinkhole IPs recognized in hosts-format blocklists.
pub const SINKHOLE_IPS: &[&str] = &["0.0.0.0", "127.0.0.1", "::1", "::0", "::"];

pub fn is_reserved_local_name(name: &str) -> bool {
    RESERVED_LOCAL_NAMES.contains(&name) || name.starts_with("ip6-")
}

pub fn is_hop_by_hop(header_name: &str) -> bool {
    let lower = header_name.to_ascii_lowercase();
    HOP_BY_HOP_HEADERS.contains(&lower.as_str())
}
