//! Blocklist fetching and periodic refresh.

use super::parser;
use super::DomainMatcher;
use crate::constants::LIST_FETCH_TIMEOUT;
use crate::error::{FpsError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// One remote blocklist. `last_fetched_unix` and `domain_count` are
/// updated after every successful fetch and exposed read-only through
/// the management stats endpoint.
#[derive(Debug)]
pub struct BlocklistSource {
    pub name: String,
    pub url: String,
    pub path: PathBuf,
    pub enabled: bool,
    last_fetched_unix: AtomicI64,
    domain_count: std::sync::atomic::AtomicUsize,
}

impl Clone for BlocklistSource {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            url: self.url.clone(),
            path: self.path.clone(),
            enabled: self.enabled,
            last_fetched_unix: AtomicI64::new(self.last_fetched_unix.load(Ordering::Relaxed)),
            domain_count: std::sync::atomic::AtomicUsize::new(
                self.domain_count.load(Ordering::Relaxed),
            ),
        }
    }
}

impl BlocklistSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            path,
            enabled: true,
            last_fetched_unix: AtomicI64::new(0),
            domain_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn last_fetched_unix(&self) -> i64 {
        self.last_fetched_unix.load(Ordering::Relaxed)
    }

    pub fn domain_count(&self) -> usize {
        self.domain_count.load(Ordering::Relaxed)
    }
}

/// Thread-safe store of configured sources plus the merged set of
/// domains currently loaded from disk, kept separately from the live
/// `DomainMatcher` so a failed re-fetch never discards what is already
/// loaded.
pub struct BlocklistStore {
    pub sources: Vec<Arc<BlocklistSource>>,
}

impl BlocklistStore {
    pub fn new(sources: Vec<BlocklistSource>) -> Self {
        Self {
            sources: sources.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Periodic fetcher that downloads each configured source, parses it,
/// and merges the result into a shared `DomainMatcher`.
pub struct BlocklistUpdater {
    store: BlocklistStore,
    matcher: Arc<DomainMatcher>,
    client: reqwest::Client,
}

impl BlocklistUpdater {
    pub fn new(store: BlocklistStore, matcher: Arc<DomainMatcher>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LIST_FETCH_TIMEOUT)
            .user_agent("face-puncher-supreme")
            .build()
            .unwrap_or_default();

        Self {
            store,
            matcher,
            client,
        }
    }

    pub fn sources(&self) -> &[Arc<BlocklistSource>] {
        &self.store.sources
    }

    /// Fetch every enabled source, parse it, and merge the union of all
    /// successfully parsed domains into the matcher in one atomic swap.
    /// A failure fetching or parsing one source is logged and skipped;
    /// it never prevents the others from loading.
    pub async fn refresh_all(&self) -> Result<()> {
        let mut merged = std::collections::HashSet::new();
        let mut ok = 0usize;
        let mut failed = 0usize;

        for source in &self.store.sources {
            if !source.enabled {
                continue;
            }
            match self.fetch_one(source).await {
                Ok(domains) => {
                    source.domain_count.store(domains.len(), Ordering::Relaxed);
                    source
                        .last_fetched_unix
                        .store(unix_now(), Ordering::Relaxed);
                    merged.extend(domains);
                    ok += 1;
                }
                Err(e) => {
                    failed += 1;
                    warn!(source = %source.name, error = %e, "blocklist fetch failed, keeping previous state for this source");
                }
            }
        }

        info!(ok, failed, total_domains = merged.len(), "blocklist refresh complete");

        if ok == 0 && failed > 0 {
            return Err(FpsError::ListFetch {
                url: "(all sources)".to_string(),
                reason: "every configured blocklist source failed".to_string(),
            });
        }

        if ok > 0 {
            self.matcher.set_blocklist(merged);
        }
        Ok(())
    }

    async fn fetch_one(
        &self,
        source: &BlocklistSource,
    ) -> Result<std::collections::BTreeSet<String>> {
        debug!(source = %source.name, url = %source.url, "fetching blocklist");
        let bytes = self.download(&source.url).await?;

        if let Some(parent) = source.path.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        let _ = fs::write(&source.path, &bytes).await;

        Ok(parser::parse_all(&bytes))
    }

    async fn download(&self, url: &str) -> Result<bytes::Bytes> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FpsError::ListFetch {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(FpsError::ListFetch {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status()),
            });
        }

        response.bytes().await.map_err(|e| FpsError::ListFetch {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    /// Load whatever is already on disk for each source, without
    /// performing a network fetch. Used at startup before the first
    /// scheduled refresh completes.
    pub async fn load_cached(&self) -> Result<()> {
        let mut merged = std::collections::HashSet::new();
        for source in &self.store.sources {
            if !source.enabled || !source.path.exists() {
                continue;
            }
            match fs::read(&source.path).await {
                Ok(bytes) => {
                    let domains = parser::parse_all(&bytes);
                    source.domain_count.store(domains.len(), Ordering::Relaxed);
                    merged.extend(domains);
                }
                Err(e) => warn!(source = %source.name, error = %e, "failed to read cached blocklist"),
            }
        }
        if !merged.is_empty() {
            self.matcher.set_blocklist(merged);
        }
        Ok(())
    }

    /// Spawn the periodic refresh loop on the current runtime. Runs
    /// until the returned `JoinHandle` is aborted (wired into graceful
    /// shutdown by the caller).
    pub fn spawn_auto_refresh(self: Arc<Self>, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.refresh_all().await {
                    error!(error = %e, "scheduled blocklist refresh failed");
                }
            }
        })
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Default blocklist sources, mirroring well-known public lists.
pub fn default_blocklist_sources() -> Vec<BlocklistSource> {
    vec![
        BlocklistSource::new(
            "StevenBlack",
            "https://raw.githubusercontent.com/StevenBlack/hosts/master/hosts",
            PathBuf::from("blocklists/stevenblack-hosts.txt"),
        ),
        BlocklistSource::new(
            "AdGuard DNS",
            "https://adguardteam.github.io/AdGuardSDNSFilter/Filters/filter.txt",
            PathBuf::from("blocklists/adguard-dns.txt"),
        ),
        BlocklistSource::new(
            "Malware domains",
            "https://malware-filter.gitlab.io/malware-filter/urlhaus-filter-hosts.txt",
            PathBuf::from("blocklists/malware-domains.txt"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_cached_merges_present_files_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        fs::write(&path, b"0.0.0.0 ads.example.com\n").await.unwrap();

        let mut missing = BlocklistSource::new("missing", "http://example.invalid", dir.path().join("missing.txt"));
        missing.enabled = true;
        let present = BlocklistSource::new("present", "http://example.invalid", path);

        let store = BlocklistStore::new(vec![present, missing]);
        let matcher = Arc::new(DomainMatcher::new());
        let updater = BlocklistUpdater::new(store, matcher.clone());

        updater.load_cached().await.unwrap();
        assert!(matcher.is_blocked("ads.example.com"));
    }
}
