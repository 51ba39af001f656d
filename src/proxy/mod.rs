//! Explicit proxy dispatcher and transparent listeners,
//! plus the hop-by-hop header stripping they share with the MITM loop.

pub mod dispatcher;
pub mod transparent;

use crate::constants::is_hop_by_hop;
use http::HeaderMap;

/// Remove every hop-by-hop header in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let to_remove: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name.as_str()))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_hop_by_hop_removes_listed_headers_only() {
        let mut headers = HeaderMap::new();
        headers.insert("Connection", "keep-alive".parse().unwrap());
        headers.insert("Transfer-Encoding", "chunked".parse().unwrap());
        headers.insert("Content-Type", "text/html".parse().unwrap());

        strip_hop_by_hop(&mut headers);

        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("transfer-encoding"));
        assert!(headers.contains_key("content-type"));
    }
}
