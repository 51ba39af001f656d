//! Byte-level HTML element filter. Operates without a DOM
//! parser: finds a marker string, scans forward for the matching close
//! tag, and removes the whole element's byte range.

use super::{FilterContext, FilterResult, Placeholder, Plugin, PluginConfig};
use crate::error::{FpsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

/// One removable element: a unique opening-tag marker plus the tag name
/// used to find its matching close tag.
#[derive(Debug, Clone, Deserialize)]
struct ElementRule {
    name: String,
    marker: String,
    tag_name: String,
}

/// Default element set, derived empirically from captured traffic.
fn default_rules() -> Vec<ElementRule> {
    vec![
        ElementRule {
            name: "shreddit-ad-post".to_string(),
            marker: "<shreddit-ad-post".to_string(),
            tag_name: "shreddit-ad-post".to_string(),
        },
        ElementRule {
            name: "shreddit-comment-tree-ads".to_string(),
            marker: "<shreddit-comment-tree-ads".to_string(),
            tag_name: "shreddit-comment-tree-ads".to_string(),
        },
        ElementRule {
            name: "shreddit-comments-page-ad".to_string(),
            marker: "<shreddit-comments-page-ad".to_string(),
            tag_name: "shreddit-comments-page-ad".to_string(),
        },
        ElementRule {
            name: "ad-event-tracker".to_string(),
            marker: "<ad-event-tracker".to_string(),
            tag_name: "ad-event-tracker".to_string(),
        },
    ]
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

pub struct RedditPromotionsPlugin {
    domains: Vec<String>,
    path_prefixes: Vec<String>,
    rules: Vec<ElementRule>,
    placeholder: Placeholder,
}

impl RedditPromotionsPlugin {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let path_prefixes = config
            .options
            .get("path_prefixes")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_else(|| vec!["/".to_string()]);

        let rules = match config.options.get("rules") {
            Some(v) => serde_json::from_value(v.clone()).map_err(|e| FpsError::InvalidPluginConfig {
                plugin: config.name.clone(),
                reason: format!("invalid rules: {e}"),
            })?,
            None => default_rules(),
        };

        Ok(Self {
            domains: config.domains.clone(),
            path_prefixes,
            rules,
            placeholder: config.placeholder,
        })
    }

    fn path_matches(&self, path: &str) -> bool {
        self.path_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    fn placeholder_bytes(&self) -> &'static [u8] {
        match self.placeholder {
            Placeholder::Visible => {
                br#"<span style="display:inline-block;max-width:1px;white-space:nowrap;overflow:hidden;text-overflow:ellipsis">&nbsp;</span>"#
            }
            Placeholder::Comment => b"<!-- removed -->",
            Placeholder::None => b"",
        }
    }

    /// Remove every occurrence of `rule` from `body`, returning the new
    /// body and the number of elements removed. An occurrence with no
    /// matching close tag is left in place (spec: "bails out ... does
    /// not truncate the body").
    fn apply_rule(&self, rule: &ElementRule, body: &[u8]) -> (Vec<u8>, u64) {
        if find_sub(body, rule.marker.as_bytes()).is_none() {
            return (body.to_vec(), 0); // quick-skip
        }

        let close_tag = format!("</{}>", rule.tag_name);
        let mut out = Vec::with_capacity(body.len());
        let mut removed = 0u64;
        let mut cursor = 0usize;

        loop {
            match find_sub(&body[cursor..], rule.marker.as_bytes()) {
                None => {
                    out.extend_from_slice(&body[cursor..]);
                    break;
                }
                Some(rel_start) => {
                    let start = cursor + rel_start;
                    match find_sub(&body[start..], close_tag.as_bytes()) {
                        None => {
                            // No closing tag found; emit the rest untouched.
                            out.extend_from_slice(&body[cursor..]);
                            break;
                        }
                        Some(rel_end) => {
                            let end = start + rel_end + close_tag.len();
                            out.extend_from_slice(&body[cursor..start]);
                            out.extend_from_slice(self.placeholder_bytes());
                            removed += 1;
                            cursor = end;
                        }
                    }
                }
            }
        }

        (out, removed)
    }
}

#[async_trait]
impl Plugin for RedditPromotionsPlugin {
    fn name(&self) -> &str {
        "reddit-promotions"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn filter(&self, ctx: &FilterContext<'_>, body: Bytes) -> Result<(Bytes, FilterResult)> {
        if !self.path_matches(ctx.uri.path()) {
            return Ok((body, FilterResult::unmatched()));
        }

        let mut current = body.to_vec();
        let mut per_rule = Vec::new();
        let mut total = 0u64;
        let mut first_rule_name = None;

        for rule in &self.rules {
            let (next, removed) = self.apply_rule(rule, &current);
            current = next;
            if removed > 0 {
                if first_rule_name.is_none() {
                    first_rule_name = Some(rule.name.clone());
                }
                total += removed;
                per_rule.push((rule.name.clone(), removed));
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
    use crate::plugins::PluginMode;
    use http::{HeaderMap, Method, StatusCode, Uri};

    fn plugin() -> RedditPromotionsPlugin {
        let config = PluginConfig {
            name: "reddit-promotions".to_string(),
            enabled: true,
            mode: PluginMode::Filter,
            placeholder: Placeholder::Comment,
            domains: vec![],
            priority: 0,
            options: serde_json::Value::Null,
        };
        RedditPromotionsPlugin::new(&config).unwrap()
    }

    async fn run(plugin: &RedditPromotionsPlugin, path: &str, body: &[u8]) -> (Bytes, FilterResult) {
        let uri: Uri = path.parse().unwrap();
        let method = Method::GET;
        let req_headers = HeaderMap::new();
        let resp_headers = HeaderMap::new();
        let ctx = FilterContext {
            domain: "www.reddit.com",
            method: &method,
            uri: &uri,
            request_headers: &req_headers,
            status: StatusCode::OK,
            response_headers: &resp_headers,
        };
        plugin.filter(&ctx, Bytes::copy_from_slice(body)).await.unwrap()
    }

    #[tokio::test]
    async fn removes_element_and_inserts_placeholder() {
        let plugin = plugin();
        let body = b"<div><shreddit-ad-post id=1>junk</shreddit-ad-post></div>";
        let (out, result) = run(&plugin, "/r/rust", body).await;
        assert!(result.modified);
        assert_eq!(result.total_count, 1);
        assert_eq!(out, Bytes::from_static(b"<div><!-- removed --></div>"));
    }

    #[tokio::test]
    async fn leaves_body_untouched_when_no_closing_tag() {
        let plugin = plugin();
        let body = b"<div><shreddit-ad-post id=1>junk";
        let (out, result) = run(&plugin, "/r/rust", body).await;
        assert!(!result.modified);
        assert_eq!(out, Bytes::copy_from_slice(body));
    }

    #[tokio::test]
    async fn skips_bodies_outside_scoped_paths() {
        let plugin = RedditPromotionsPlugin::new(&PluginConfig {
            name: "reddit-promotions".to_string(),
            enabled: true,
            mode: PluginMode::Filter,
            placeholder: Placeholder::Comment,
            domains: vec![],
            priority: 0,
            options: serde_json::json!({"path_prefixes": ["/r/"]}),
        })
        .unwrap();
        let body = b"<shreddit-ad-post></shreddit-ad-post>";
        let (out, result) = run(&plugin, "/settings", body).await;
        assert!(!result.matched);
        assert_eq!(out, Bytes::copy_from_slice(body));
    }
}
