//! Runtime configuration. This is a minimal TOML-based loader sufficient
//! to run the core standalone and exercise hot reload; a richer
//! production config loader (e.g. YAML-backed, with a management UI) is
//! out of scope for this crate.

use crate::error::{FpsError, Result};
use crate::plugins::PluginConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlocklistSourceConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MitmConfig {
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    #[serde(default)]
    pub domains: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparentConfig {
    #[serde(default)]
    pub enabled: bool,
    pub http_addr: Option<SocketAddr>,
    pub https_addr: Option<SocketAddr>,
}

fn default_true() -> bool {
    true
}

fn default_management_prefix() -> String {
    "/fps/".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_verbosity() -> String {
    "info".to_string()
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_header_timeout_secs() -> u64 {
    10
}

/// Everything the proxy core needs at startup and across a hot reload.
/// Derives `Serialize`/`Deserialize` so it can be loaded from TOML and
/// round-tripped for hot reload diffing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,

    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_header_timeout_secs")]
    pub header_timeout_secs: u64,

    #[serde(default = "default_management_prefix")]
    pub management_prefix: String,

    #[serde(default)]
    pub blocklist_urls: Vec<BlocklistSourceConfig>,
    #[serde(default)]
    pub inline_blocklist: Vec<String>,
    #[serde(default)]
    pub allowlist: Vec<String>,

    pub mitm: MitmConfig,

    #[serde(default)]
    pub plugins: Vec<PluginConfig>,

    #[serde(default)]
    pub transparent: TransparentConfig,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_verbosity")]
    pub verbosity: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            header_timeout_secs: default_header_timeout_secs(),
            management_prefix: default_management_prefix(),
            blocklist_urls: Vec::new(),
            inline_blocklist: Vec::new(),
            allowlist: Vec::new(),
            mitm: MitmConfig {
                ca_cert_path: PathBuf::from("ca/fps-ca.pem"),
                ca_key_path: PathBuf::from("ca/fps-ca.key"),
                domains: Vec::new(),
            },
            plugins: Vec::new(),
            transparent: TransparentConfig {
                enabled: false,
                http_addr: None,
                https_addr: None,
            },
            data_dir: default_data_dir(),
            verbosity: default_verbosity(),
        }
    }
}

impl Config {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| FpsError::ConfigParse(e.to_string()))
    }

    pub async fn load_from_file(path: &std::path::Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(FpsError::from)?;
        let config = Self::from_toml_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply a partial TOML document on top of this config, as used by
    /// hot reload. Unknown tables/keys in `value` beyond the
    /// fields recognized here are rejected by `toml`'s deny-unknown
    /// behavior only if this struct enables it; we intentionally don't,
    /// so forward-compatible extra keys are ignored.
    pub fn apply_partial_update(&mut self, value: &toml::Value) -> Result<()> {
        let merged = toml::Value::try_from(&*self).map_err(|e| FpsError::ConfigParse(e.to_string()))?;
        let mut merged_table = match merged {
            toml::Value::Table(t) => t,
            _ => unreachable!("Config always serializes to a table"),
        };

        if let toml::Value::Table(incoming) = value {
            for (k, v) in incoming {
                merged_table.insert(k.clone(), v.clone());
            }
        }

        let updated: Config = toml::Value::Table(merged_table)
            .try_into()
            .map_err(|e: toml::de::Error| FpsError::ConfigParse(e.to_string()))?;

        *self = updated;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.management_prefix.is_empty() || !self.management_prefix.starts_with('/') {
            return Err(FpsError::ConfigInvalid(
                "management_prefix must be a non-empty absolute path".to_string(),
            ));
        }

        for domain in &self.mitm.domains {
            if domain.is_empty() {
                return Err(FpsError::ConfigInvalid("mitm.domains entries must be non-empty".to_string()));
            }
        }

        for plugin in &self.plugins {
            for d in &plugin.domains {
                if !self.mitm.domains.iter().any(|m| m == d) {
                    return Err(FpsError::ConfigInvalid(format!(
                        "plugin {} scopes to domain {d} which is not in mitm.domains",
                        plugin.name
                    )));
                }
            }
        }

        if self.transparent.enabled
            && self.transparent.http_addr.is_none()
            && self.transparent.https_addr.is_none()
        {
            return Err(FpsError::ConfigInvalid(
                "transparent.enabled requires at least one of http_addr/https_addr".to_string(),
            ));
        }

        Ok(())
    }

    /// Fields that cannot change via hot reload: listener addresses, the
    /// MITM domain set, and CA paths. A reload attempting to change any
    /// of these must be rejected without mutating state.
    pub fn rejects_reload_from(&self, previous: &Config) -> Option<String> {
        if self.listen_addr != previous.listen_addr {
            return Some("listen_addr cannot change without a restart".to_string());
        }
        if self.transparent.http_addr != previous.transparent.http_addr
            || self.transparent.https_addr != previous.transparent.https_addr
        {
            return Some("transparent listener addresses cannot change without a restart".to_string());
        }
        if self.mitm.domains != previous.mitm.domains {
            return Some("mitm.domains cannot change without a restart".to_string());
        }
        if self.mitm.ca_cert_path != previous.mitm.ca_cert_path
            || self.mitm.ca_key_path != previous.mitm.ca_key_path
        {
            return Some("CA paths cannot change without a restart".to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
        listen_addr = "127.0.0.1:8080"

        [mitm]
        ca_cert_path = "ca/fps-ca.pem"
        ca_key_path = "ca/fps-ca.key"
        domains = ["example.com"]
        "#
    }

    #[test]
    fn default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn loads_minimal_toml() {
        let config = Config::from_toml_str(sample_toml()).unwrap();
        assert_eq!(config.mitm.domains, vec!["example.com".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_plugin_domain_outside_mitm_set() {
        let mut config = Config::from_toml_str(sample_toml()).unwrap();
        config.plugins.push(PluginConfig {
            name: "reddit-promotions".to_string(),
            enabled: true,
            mode: crate::plugins::PluginMode::Filter,
            placeholder: crate::plugins::Placeholder::Comment,
            domains: vec!["other.com".to_string()],
            priority: 0,
            options: serde_json::Value::Null,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn apply_partial_update_overrides_allowlist_only() {
        let mut config = Config::from_toml_str(sample_toml()).unwrap();
        let patch: toml::Value = toml::from_str(r#"allowlist = ["safe.example.com"]"#).unwrap();
        config.apply_partial_update(&patch).unwrap();
        assert_eq!(config.allowlist, vec!["safe.example.com".to_string()]);
        assert_eq!(config.mitm.domains, vec!["example.com".to_string()]);
    }

    #[test]
    fn reload_rejects_listen_addr_change() {
        let original = Config::from_toml_str(sample_toml()).unwrap();
        let mut changed = original.clone();
        changed.listen_addr = "127.0.0.1:9090".parse().unwrap();
        assert!(changed.rejects_reload_from(&original).is_some());
    }

    #[test]
    fn reload_allows_allowlist_change() {
        let original = Config::from_toml_str(sample_toml()).unwrap();
        let mut changed = original.clone();
        changed.allowlist.push("safe.example.com".to_string());
        assert!(changed.rejects_reload_from(&original).is_none());
    }
}
