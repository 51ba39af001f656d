//! Content-filter plugin pipeline.
//!
//! Plugins are built from a compile-time registry keyed by name — there
//! is no dynamic loading. Active plugins are sorted by ascending
//! priority and composed into a single response modifier that the MITM
//! engine invokes once per text response.

pub mod intercept;
pub mod reddit;
pub mod rewrite;

use crate::error::{FpsError, Result};
use crate::stats::StatsSink;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, warn};

/// How a plugin is operated: `Intercept` plugins never modify the body
/// (they just observe); `Filter` plugins may rewrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginMode {
    Intercept,
    Filter,
}

/// What a filter plugin leaves behind in place of removed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placeholder {
    Visible,
    Comment,
    None,
}

/// Declarative configuration for one plugin instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub mode: PluginMode,
    #[serde(default = "default_placeholder")]
    pub placeholder: Placeholder,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn default_placeholder() -> Placeholder {
    Placeholder::Comment
}

/// Request/response context a plugin inspects. Borrowed for the
/// duration of one `filter` call; the pipeline owns the body between
/// plugin invocations.
pub struct FilterContext<'a> {
    pub domain: &'a str,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub request_headers: &'a HeaderMap,
    pub status: StatusCode,
    pub response_headers: &'a HeaderMap,
}

/// Outcome of one plugin invocation.
#[derive(Debug, Clone, Default)]
pub struct FilterResult {
    pub matched: bool,
    pub modified: bool,
    pub first_rule_name: Option<String>,
    pub total_count: u64,
    pub per_rule_counts: Vec<(String, u64)>,
}

impl FilterResult {
    pub fn unmatched() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "1.0.0"
    }

    /// Domains this plugin applies to; empty means every MITM domain.
    fn domains(&self) -> &[String];

    /// Inspect (and possibly rewrite) one response body.
    async fn filter(&self, ctx: &FilterContext<'_>, body: Bytes) -> Result<(Bytes, FilterResult)>;

    async fn close(&self) {}
}

fn plugin_applies(plugin: &dyn Plugin, domain: &str) -> bool {
    plugin.domains().is_empty()
        || plugin
            .domains()
            .iter()
            .any(|d| d == domain || domain.ends_with(&format!(".{d}")))
}

/// Construct a plugin instance by name from its validated configuration.
/// The compile-time registry: add a new plugin here, nowhere else,
/// for it to become selectable.
fn build_plugin(config: &PluginConfig) -> Result<Box<dyn Plugin>> {
    match config.name.as_str() {
        "intercept" => Ok(Box::new(intercept::InterceptPlugin::new(config)?)),
        "reddit-promotions" => Ok(Box::new(reddit::RedditPromotionsPlugin::new(config)?)),
        "rewrite-rules" => Ok(Box::new(rewrite::RewriteRulesPlugin::new(config)?)),
        other => Err(FpsError::UnknownPlugin(other.to_string())),
    }
}

fn validate_config(config: &PluginConfig, mitm_domains: &[String]) -> Result<()> {
    if !matches!(config.mode, PluginMode::Intercept | PluginMode::Filter) {
        return Err(FpsError::InvalidPluginConfig {
            plugin: config.name.clone(),
            reason: "mode must be intercept or filter".to_string(),
        });
    }
    for d in &config.domains {
        if !mitm_domains.iter().any(|m| m == d) {
            return Err(FpsError::InvalidPluginConfig {
                plugin: config.name.clone(),
                reason: format!("domain {d} is not in the MITM domain set"),
            });
        }
    }
    Ok(())
}

#[derive(Default)]
struct PipelineCounters {
    responses_inspected: AtomicU64,
    responses_matched: AtomicU64,
    responses_modified: AtomicU64,
    per_rule: DashMap<String, AtomicU64>,
}

/// The composed `response_modifier` handed to the MITM engine: runs
/// every active plugin in priority order, each seeing the previous
/// plugin's output.
pub struct PluginPipeline {
    plugins: Vec<Box<dyn Plugin>>,
    counters: PipelineCounters,
}

impl PluginPipeline {
    /// Validate and build every configured plugin, dropping disabled
    /// ones, sorted by ascending priority.
    pub fn build(configs: &[PluginConfig], mitm_domains: &[String]) -> Result<Self> {
        let mut enabled: Vec<&PluginConfig> = configs.iter().filter(|c| c.enabled).collect();
        enabled.sort_by_key(|c| c.priority);

        let mut plugins = Vec::with_capacity(enabled.len());
        for config in enabled {
            validate_config(config, mitm_domains)?;
            plugins.push(build_plugin(config)?);
        }

        Ok(Self {
            plugins,
            counters: PipelineCounters::default(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run every plugin that applies to `ctx.domain`, in order,
    /// aggregating stats as each one reports and forwarding each
    /// invocation to `stats`.
    pub async fn run(&self, ctx: &FilterContext<'_>, stats: &dyn StatsSink, mut body: Bytes) -> Result<Bytes> {
        for plugin in &self.plugins {
            if !plugin_applies(plugin.as_ref(), ctx.domain) {
                continue;
            }

            self.counters.responses_inspected.fetch_add(1, Ordering::Relaxed);
            stats.on_plugin_inspect(plugin.name());

            let (next_body, result) = plugin.filter(ctx, body).await.map_err(|e| {
                error!(plugin = plugin.name(), error = %e, "plugin filter failed, aborting pipeline for this response");
                FpsError::FilterError {
                    plugin: plugin.name().to_string(),
                    reason: e.to_string(),
                }
            })?;
            body = next_body;

            if result.matched {
                self.counters.responses_matched.fetch_add(1, Ordering::Relaxed);
            }
            if result.modified {
                self.counters.responses_modified.fetch_add(1, Ordering::Relaxed);
            }
            if result.per_rule_counts.is_empty() {
                if result.matched {
                    let rule = result.first_rule_name.as_deref().unwrap_or("default");
                    stats.on_plugin_match(plugin.name(), rule, result.modified, result.total_count);
                }
            } else {
                for (rule, count) in &result.per_rule_counts {
                    let key = format!("{}:{}", plugin.name(), rule);
                    self.counters
                        .per_rule
                        .entry(key)
                        .or_insert_with(|| AtomicU64::new(0))
                        .fetch_add(*count, Ordering::Relaxed);
                    stats.on_plugin_match(plugin.name(), rule, result.modified, *count);
                }
            }
        }
        Ok(body)
    }

    pub fn responses_inspected(&self) -> u64 {
        self.counters.responses_inspected.load(Ordering::Relaxed)
    }

    pub fn responses_matched(&self) -> u64 {
        self.counters.responses_matched.load(Ordering::Relaxed)
    }

    pub fn responses_modified(&self) -> u64 {
        self.counters.responses_modified.load(Ordering::Relaxed)
    }

    pub fn per_rule_counts(&self) -> Vec<(String, u64)> {
        self.counters
            .per_rule
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect()
    }
}

/// Content types the MITM loop buffers and hands to the pipeline;
/// everything else streams through untouched.
pub fn is_modifiable_content_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or("").trim();
    base.starts_with("text/")
        || base == "application/json"
        || base == "application/javascript"
        || base == "application/xml"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_config_rejects_domain_outside_mitm_set() {
        let config = PluginConfig {
            name: "reddit-promotions".to_string(),
            enabled: true,
            mode: PluginMode::Filter,
            placeholder: Placeholder::Comment,
            domains: vec!["old.reddit.com".to_string()],
            priority: 0,
            options: serde_json::Value::Null,
        };
        let err = validate_config(&config, &["www.reddit.com".to_string()]).unwrap_err();
        assert!(matches!(err, FpsError::InvalidPluginConfig { .. }));
    }

    #[test]
    fn is_modifiable_content_type_matches_spec_list() {
        assert!(is_modifiable_content_type("text/html; charset=utf-8"));
        assert!(is_modifiable_content_type("application/json"));
        assert!(is_modifiable_content_type("application/javascript"));
        assert!(is_modifiable_content_type("application/xml"));
        assert!(!is_modifiable_content_type("image/png"));
        assert!(!is_modifiable_content_type("application/octet-stream"));
    }

    #[test]
    fn build_sorts_by_priority_ascending() {
        let configs = vec![
            PluginConfig {
                name: "rewrite-rules".to_string(),
                enabled: true,
                mode: PluginMode::Filter,
                placeholder: Placeholder::None,
                domains: vec![],
                priority: 10,
                options: serde_json::json!({"rules": []}),
            },
            PluginConfig {
                name: "intercept".to_string(),
                enabled: true,
                mode: PluginMode::Intercept,
                placeholder: Placeholder::None,
                domains: vec![],
                priority: 0,
                options: serde_json::json!({"base_dir": std::env::temp_dir().to_string_lossy()}),
            },
        ];
        let pipeline = PluginPipeline::build(&configs, &[]).unwrap();
        assert_eq!(pipeline.plugins[0].name(), "intercept");
        assert_eq!(pipeline.plugins[1].name(), "rewrite-rules");
    }
}
