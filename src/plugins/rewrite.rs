//! Rewrite-rules filter: an API-managed set of literal/regex
//! replacements, HTML-safe against `<script>`/`<style>` ranges.

use super::{FilterContext, FilterResult, Plugin, PluginConfig};
use crate::error::{FpsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Persistent, API-editable rule definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRuleDef {
    pub id: String,
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    pub is_regex: bool,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub url_patterns: Vec<String>,
    #[serde(default = "default_content_types")]
    pub content_types: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_content_types() -> Vec<String> {
    vec!["text/html".to_string(), "text/plain".to_string()]
}

/// One rule after validation/compilation. Regex rules compile once;
/// an invalid pattern is logged and the rule is dropped from the
/// active set (spec: "invalid regex logged and skipped").
enum CompiledPattern {
    Literal(Vec<u8>),
    Regex(Regex),
}

struct CompiledRule {
    def: RewriteRuleDef,
    pattern: CompiledPattern,
}

fn compile(def: &RewriteRuleDef) -> Option<CompiledPattern> {
    if def.is_regex {
        match Regex::new(&def.pattern) {
            Ok(re) => Some(CompiledPattern::Regex(re)),
            Err(e) => {
                warn!(rule = %def.name, error = %e, "invalid regex, skipping rule");
                None
            }
        }
    } else {
        Some(CompiledPattern::Literal(def.pattern.clone().into_bytes()))
    }
}

/// Byte ranges of `<script>…</script>` / `<style>…</style>` blocks,
/// recomputed after every modifying rule.
fn protected_ranges(body: &[u8]) -> Vec<(usize, usize)> {
    let mut ranges = Vec::new();
    for tag in ["script", "style"] {
        let open = format!("<{tag}");
        let close = format!("</{tag}>");
        let mut cursor = 0usize;
        while let Some(rel) = find_open_tag(&body[cursor..], open.as_bytes()) {
            let start = cursor + rel;
            match find_bytes(&body[start..], close.as_bytes()) {
                Some(rel_end) => {
                    let end = start + rel_end + close.len();
                    ranges.push((start, end));
                    cursor = end;
                }
                None => break,
            }
        }
    }
    ranges.sort_unstable();
    ranges
}

/// Match `open` only when immediately followed by `>`, whitespace, or
/// `/` — avoids matching `<scripted` as `<script`.
fn find_open_tag(haystack: &[u8], open: &[u8]) -> Option<usize> {
    let mut from = 0usize;
    while let Some(rel) = find_bytes(&haystack[from..], open) {
        let pos = from + rel;
        let next = haystack.get(pos + open.len());
        match next {
            Some(b'>') | Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'/') => {
                return Some(pos)
            }
            _ => from = pos + 1,
        }
        if from >= haystack.len() {
            return None;
        }
    }
    None
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn inside_any(pos: usize, ranges: &[(usize, usize)]) -> bool {
    ranges.iter().any(|(s, e)| pos >= *s && pos < *e)
}

/// Apply one compiled rule to `body`, skipping matches that start
/// inside a protected range when `html_safe` is set. Returns the new
/// body and the number of replacements made.
fn apply_rule(rule: &CompiledRule, body: &[u8], html_safe: bool) -> (Vec<u8>, u64) {
    let ranges = if html_safe { protected_ranges(body) } else { Vec::new() };

    match &rule.pattern {
        CompiledPattern::Literal(needle) => {
            if find_bytes(body, needle).is_none() {
                return (body.to_vec(), 0);
            }
            let replacement = rule.def.replacement.as_bytes();
            let mut out = Vec::with_capacity(body.len());
            let mut cursor = 0usize;
            let mut count = 0u64;
            while let Some(rel) = find_bytes(&body[cursor..], needle) {
                let start = cursor + rel;
                if html_safe && inside_any(start, &ranges) {
                    out.extend_from_slice(&body[cursor..start + 1]);
                    cursor = start + 1;
                    continue;
                }
                out.extend_from_slice(&body[cursor..start]);
                out.extend_from_slice(replacement);
                count += 1;
                cursor = start + needle.len();
            }
            out.extend_from_slice(&body[cursor..]);
            (out, count)
        }
        CompiledPattern::Regex(re) => {
            let mut out = Vec::with_capacity(body.len());
            let mut cursor = 0usize;
            let mut count = 0u64;
            for m in re.find_iter(body) {
                if m.start() < cursor {
                    continue;
                }
                if html_safe && inside_any(m.start(), &ranges) {
                    continue;
                }
                out.extend_from_slice(&body[cursor..m.start()]);
                let mut expanded = Vec::new();
                if let Some(caps) = re.captures(&body[m.start()..m.end()]) {
                    caps.expand(rule.def.replacement.as_bytes(), &mut expanded);
                }
                out.extend_from_slice(&expanded);
                count += 1;
                cursor = m.end();
            }
            out.extend_from_slice(&body[cursor..]);
            (out, count)
        }
    }
}

pub struct RewriteRulesPlugin {
    domains: Vec<String>,
    rules: RwLock<Arc<Vec<CompiledRule>>>,
}

impl RewriteRulesPlugin {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let defs: Vec<RewriteRuleDef> = match config.options.get("rules") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| FpsError::InvalidPluginConfig {
                plugin: config.name.clone(),
                reason: format!("invalid rules: {e}"),
            })?,
            None => Vec::new(),
        };

        let compiled = Self::compile_all(defs);
        Ok(Self {
            domains: config.domains.clone(),
            rules: RwLock::new(Arc::new(compiled)),
        })
    }

    fn compile_all(defs: Vec<RewriteRuleDef>) -> Vec<CompiledRule> {
        defs.into_iter()
            .filter(|d| d.enabled)
            .filter_map(|def| {
                let pattern = compile(&def)?;
                Some(CompiledRule { def, pattern })
            })
            .collect()
    }

    /// Replace the active rule set wholesale. Called on CRUD mutation
    /// or hot reload; the swap is atomic under the write lock.
    pub fn set_rules(&self, defs: Vec<RewriteRuleDef>) {
        let compiled = Self::compile_all(defs);
        *self.rules.write() = Arc::new(compiled);
    }

    fn rule_applies(rule: &CompiledRule, domain: &str, path: &str, content_type: &str) -> bool {
        let domain_ok = rule.def.domains.is_empty() || rule.def.domains.iter().any(|d| d == domain);
        let path_ok = rule.def.url_patterns.is_empty()
            || rule.def.url_patterns.iter().any(|p| path.starts_with(p.as_str()));
        let ct_base = content_type.split(';').next().unwrap_or("").trim();
        let ct_ok = rule.def.content_types.iter().any(|c| c == ct_base);
        domain_ok && path_ok && ct_ok
    }
}

#[async_trait]
impl Plugin for RewriteRulesPlugin {
    fn name(&self) -> &str {
        "rewrite-rules"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn filter(&self, ctx: &FilterContext<'_>, body: Bytes) -> Result<(Bytes, FilterResult)> {
        let content_type = ctx
            .response_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let html_safe = content_type.split(';').next().unwrap_or("").trim() == "text/html";

        let rules = self.rules.read().clone();
        let mut current = body.to_vec();
        let mut per_rule = Vec::new();
        let mut total = 0u64;
        let mut first_rule_name = None;

        for rule in rules.iter() {
            if !Self::rule_applies(rule, ctx.domain, ctx.uri.path(), content_type) {
                continue;
            }
            let (next, count) = apply_rule(rule, &current, html_safe);
            current = next;
            if count > 0 {
                if first_rule_name.is_none() {
                    first_rule_name = Some(rule.def.name.clone());
                }
                total += count;
                per_rule.push((rule.def.name.clone(), count));
            }
        }

        let modified = total > 0;
        Ok((
            Bytes::from(current),
            FilterResult {
                matched: modified,
                modified,
                first_rule_name,
                total_count: total,
                per_rule_counts: per_rule,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Placeholder, PluginMode};
    use http::{HeaderMap, Method, StatusCode, Uri};

    fn plugin_with(defs: Vec<RewriteRuleDef>) -> RewriteRulesPlugin {
        let config = PluginConfig {
            name: "rewrite-rules".to_string(),
            enabled: true,
            mode: PluginMode::Filter,
            placeholder: Placeholder::None,
            domains: vec![],
            priority: 0,
            options: serde_json::json!({ "rules": defs }),
        };
        RewriteRulesPlugin::new(&config).unwrap()
    }

    async fn run(plugin: &RewriteRulesPlugin, content_type: &str, body: &[u8]) -> (Bytes, FilterResult) {
        let uri: Uri = "/".parse().unwrap();
        let method = Method::GET;
        let req_headers = HeaderMap::new();
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(http::header::CONTENT_TYPE, content_type.parse().unwrap());
        let ctx = FilterContext {
            domain: "example.com",
            method: &method,
            uri: &uri,
            request_headers: &req_headers,
            status: StatusCode::OK,
            response_headers: &resp_headers,
        };
        plugin.filter(&ctx, Bytes::copy_from_slice(body)).await.unwrap()
    }

    #[tokio::test]
    async fn s6_html_safe_rewrite_skips_script_blocks() {
        let plugin = plugin_with(vec![RewriteRuleDef {
            id: "1".to_string(),
            name: "cat-to-dog".to_string(),
            pattern: "cat".to_string(),
            replacement: "dog".to_string(),
            is_regex: false,
            domains: vec![],
            url_patterns: vec![],
            content_types: vec!["text/html".to_string()],
            enabled: true,
        }]);

        let body = b"<p>cat</p><script>var cat=1;</script><p>cat</p>";
        let (out, result) = run(&plugin, "text/html", body).await;
        assert_eq!(
            out,
            Bytes::from_static(b"<p>dog</p><script>var cat=1;</script><p>dog</p>")
        );
        assert_eq!(result.total_count, 2);
    }

    #[tokio::test]
    async fn content_type_outside_rule_set_is_skipped() {
        let plugin = plugin_with(vec![RewriteRuleDef {
            id: "1".to_string(),
            name: "cat-to-dog".to_string(),
            pattern: "cat".to_string(),
            replacement: "dog".to_string(),
            is_regex: false,
            domains: vec![],
            url_patterns: vec![],
            content_types: vec!["text/html".to_string()],
            enabled: true,
        }]);

        let body = b"cat";
        let (out, result) = run(&plugin, "application/json", body).await;
        assert!(!result.modified);
        assert_eq!(out, Bytes::from_static(b"cat"));
    }

    #[tokio::test]
    async fn regex_rule_expands_capture_groups() {
        let plugin = plugin_with(vec![RewriteRuleDef {
            id: "1".to_string(),
            name: "wrap-numbers".to_string(),
            pattern: r"(\d+)".to_string(),
            replacement: "[$1]".to_string(),
            is_regex: true,
            domains: vec![],
            url_patterns: vec![],
            content_types: vec!["text/plain".to_string()],
            enabled: true,
        }]);

        let (out, result) = run(&plugin, "text/plain", b"id 42 done").await;
        assert_eq!(out, Bytes::from_static(b"id [42] done"));
        assert_eq!(result.total_count, 1);
    }

    #[test]
    fn invalid_regex_is_dropped_not_fatal() {
        let plugin = plugin_with(vec![RewriteRuleDef {
            id: "1".to_string(),
            name: "bad".to_string(),
            pattern: "(unclosed".to_string(),
            replacement: "x".to_string(),
            is_regex: true,
            domains: vec![],
            url_patterns: vec![],
            content_types: vec!["text/html".to_string()],
            enabled: true,
        }]);
        assert_eq!(plugin.rules.read().len(), 0);
    }
}
