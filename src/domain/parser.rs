//! Blocklist line parser for the three recognized formats.

use crate::constants::{is_reserved_local_name, SINKHOLE_IPS};
use std::collections::BTreeSet;
use std::net::IpAddr;

/// Parse one line, returning the lowercased domain if the line encodes one.
///
/// A single fetched list may freely mix hosts-file, Adblock, and
/// bare-domain lines; each line is classified independently rather than
/// picking one format per file, matching real-world lists in the wild.
///
/// Skips blank lines, `#`/`!` comments, inline `#` comments, and reserved
/// local names. Trailing dots are trimmed.
pub fn parse_line(raw: &str) -> Option<String> {
    let line = raw.split('#').next().unwrap_or("").trim();
    if line.is_empty() || line.starts_with('!') {
        return None;
    }

    let domain = if let Some(rest) = line.strip_prefix("||") {
        parse_adblock(rest)?
    } else if let Some((ip, rest)) = line.split_once(char::is_whitespace) {
        parse_hosts(ip, rest)?
    } else {
        parse_domain_only(line)?
    };

    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() || is_reserved_local_name(&domain) {
        return None;
    }
    Some(domain)
}

fn parse_hosts(ip: &str, rest: &str) -> Option<String> {
    if ip.parse::<IpAddr>().is_err() && !SINKHOLE_IPS.contains(&ip) {
        return None;
    }
    if !SINKHOLE_IPS.contains(&ip) {
        return None;
    }
    let domain = rest.split_whitespace().next()?;
    looks_like_domain(domain).then(|| domain.to_string())
}

fn parse_adblock(rest: &str) -> Option<String> {
    let domain = rest.split(['^', '|']).next()?;
    looks_like_domain(domain).then(|| domain.to_string())
}

fn parse_domain_only(line: &str) -> Option<String> {
    if line.contains(char::is_whitespace) {
        return None;
    }
    looks_like_domain(line).then(|| line.to_string())
}

fn looks_like_domain(s: &str) -> bool {
    !s.is_empty()
        && s.contains('.')
        && !s.contains(char::is_whitespace)
        && !s.contains('/')
        && !s.contains('*')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Parse a full byte stream into a lowercased, deduplicated, sorted set
/// of domains. Parsing any input twice yields the same set.
pub fn parse_all(bytes: &[u8]) -> BTreeSet<String> {
    let text = String::from_utf8_lossy(bytes);
    text.lines().filter_map(parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_hosts_format_parse() {
        let input = "# comment\n127.0.0.1 localhost\n0.0.0.0 ad.example.com\n0.0.0.0 AD.Example.COM\n||tracker.org^\nfoo.bar\n";
        let got = parse_all(input.as_bytes());
        let want: BTreeSet<String> = ["ad.example.com", "tracker.org", "foo.bar"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("# a comment"), None);
        assert_eq!(parse_line("! adblock comment"), None);
    }

    #[test]
    fn skips_reserved_local_names() {
        assert_eq!(parse_line("0.0.0.0 localhost"), None);
        assert_eq!(parse_line("0.0.0.0 ip6-allnodes"), None);
        assert_eq!(parse_line("broadcasthost"), None);
    }

    #[test]
    fn adblock_strips_trailing_modifiers() {
        assert_eq!(
            parse_line("||ads.example.com^$third-party"),
            Some("ads.example.com".to_string())
        );
    }

    #[test]
    fn trims_trailing_dot() {
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com."),
            Some("ads.example.com".to_string())
        );
    }

    #[test]
    fn domain_only_rejects_paths_and_whitespace() {
        assert_eq!(parse_line("/not/a/domain"), None);
        assert_eq!(parse_line("has spaces.com"), None);
    }

    #[test]
    fn parsing_twice_is_idempotent() {
        let input = "0.0.0.0 a.example.com\n0.0.0.0 a.example.com\n||b.example.com^\n";
        assert_eq!(parse_all(input.as_bytes()), parse_all(input.as_bytes()));
    }
}
