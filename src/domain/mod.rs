//! Domain matcher: blocklist + allowlist lookup with per-domain counters.
//!
//! Reads are expected to vastly outnumber writes (every proxied connection
//! performs a lookup; blocklist updates and hot reloads are rare), so the
//! block/allow sets are held as `Arc`-swapped immutable snapshots behind a
//! `parking_lot::RwLock` — a read takes the lock just long enough to clone
//! the `Arc`, never while walking the set itself.

pub mod parser;
pub mod updater;

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use updater::{default_blocklist_sources, BlocklistSource, BlocklistStore, BlocklistUpdater};

/// An allowlist entry: either an exact domain, or a `*.base` suffix pattern.
/// A suffix pattern matches both `base` and every subdomain of `base`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowEntry {
    Exact(String),
    Suffix(String),
}

impl AllowEntry {
    /// Parse the textual form used in configuration: `*.base` becomes a
    /// suffix pattern, anything else an exact match.
    pub fn parse(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        match lower.strip_prefix("*.") {
            Some(base) => AllowEntry::Suffix(base.to_string()),
            None => AllowEntry::Exact(lower),
        }
    }

    fn matches(&self, domain: &str) -> bool {
        match self {
            AllowEntry::Exact(d) => d == domain,
            AllowEntry::Suffix(base) => {
                domain == base || domain.ends_with(&format!(".{base}"))
            }
        }
    }
}

/// Outcome of a matcher lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainDecision {
    Blocked(String),
    Allowed(String),
    Unknown,
}

struct Counters {
    block: DashMap<String, AtomicU64>,
    allow: DashMap<String, AtomicU64>,
}

impl Counters {
    fn new() -> Self {
        Self {
            block: DashMap::new(),
            allow: DashMap::new(),
        }
    }

    fn bump(map: &DashMap<String, AtomicU64>, domain: &str) {
        map.entry(domain.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(map: &DashMap<String, AtomicU64>) -> Vec<(String, u64)> {
        map.iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Case-insensitive exact + `*.suffix` domain matcher with atomic
/// per-domain block/allow counters.
pub struct DomainMatcher {
    blocklist: RwLock<Arc<HashSet<String>>>,
    allowlist: RwLock<Arc<Vec<AllowEntry>>>,
    counters: Counters,
}

impl Default for DomainMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self {
            blocklist: RwLock::new(Arc::new(HashSet::new())),
            allowlist: RwLock::new(Arc::new(Vec::new())),
            counters: Counters::new(),
        }
    }

    /// Normalize a host: lowercase, strip a trailing `:port` if present.
    pub fn normalize(host: &str) -> String {
        let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
        host.trim_end_matches('.').to_ascii_lowercase()
    }

    fn blocklist_contains(set: &HashSet<String>, domain: &str) -> bool {
        if set.contains(domain) {
            return true;
        }
        // A blocked domain also blocks its subdomains, matching common
        // sinkhole-list tooling (see DESIGN.md for the Open Question
        // resolution).
        let mut rest = domain;
        while let Some((_, suffix)) = rest.split_once('.') {
            if set.contains(suffix) {
                return true;
            }
            rest = suffix;
        }
        false
    }

    fn allowlist_matches(entries: &[AllowEntry], domain: &str) -> bool {
        entries.iter().any(|e| e.matches(domain))
    }

    /// Core lookup. Bumps the allow counter if an allowlisted domain would
    /// otherwise have matched the blocklist, or the block counter if it's
    /// actually blocked; allowlisted-and-not-blocked domains bump neither.
    pub fn is_blocked(&self, host: &str) -> bool {
        let domain = Self::normalize(host);
        let blocklist = self.blocklist.read().clone();
        let allowlist = self.allowlist.read().clone();

        if Self::allowlist_matches(&allowlist, &domain) {
            if Self::blocklist_contains(&blocklist, &domain) {
                Counters::bump(&self.counters.allow, &domain);
            }
            return false;
        }

        let blocked = Self::blocklist_contains(&blocklist, &domain);
        if blocked {
            Counters::bump(&self.counters.block, &domain);
        }
        blocked
    }

    /// Full decision including the `Unknown` case (domain neither
    /// blocked nor allowlisted against anything).
    pub fn decide(&self, host: &str) -> DomainDecision {
        let domain = Self::normalize(host);
        if self.is_blocked(&domain) {
            DomainDecision::Blocked(domain)
        } else {
            let allowlist = self.allowlist.read().clone();
            if Self::allowlist_matches(&allowlist, &domain) {
                DomainDecision::Allowed(domain)
            } else {
                DomainDecision::Unknown
            }
        }
    }

    pub fn set_allowlist(&self, entries: Vec<AllowEntry>) {
        *self.allowlist.write() = Arc::new(entries);
    }

    pub fn set_blocklist(&self, entries: HashSet<String>) {
        *self.blocklist.write() = Arc::new(entries);
    }

    /// Merge additional domains into the current blocklist without
    /// discarding existing entries. Used for inline blocklist config,
    /// which is merged at startup and never persisted back to disk.
    pub fn add_inline_entries(&self, entries: impl IntoIterator<Item = String>) {
        let mut write = self.blocklist.write();
        let mut merged = HashSet::clone(&write);
        merged.extend(entries.into_iter().map(|d| DomainMatcher::normalize(&d)));
        *write = Arc::new(merged);
    }

    pub fn snapshot_block_counts(&self) -> Vec<(String, u64)> {
        Counters::snapshot(&self.counters.block)
    }

    pub fn snapshot_allow_counts(&self) -> Vec<(String, u64)> {
        Counters::snapshot(&self.counters.allow)
    }

    pub fn top_blocked(&self, n: usize) -> Vec<(String, u64)> {
        top_n(self.snapshot_block_counts(), n)
    }

    pub fn top_allowed(&self, n: usize) -> Vec<(String, u64)> {
        top_n(self.snapshot_allow_counts(), n)
    }

    pub fn blocklist_len(&self) -> usize {
        self.blocklist.read().len()
    }

    pub fn allowlist_len(&self) -> usize {
        self.allowlist.read().len()
    }
}

fn top_n(mut counts: Vec<(String, u64)>, n: usize) -> Vec<(String, u64)> {
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.truncate(n);
    counts
}
