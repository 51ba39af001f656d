//! Interception-mode plugin: a generic "dump everything to disk" filter
//! that never modifies a response.

use super::{FilterContext, FilterResult, Plugin, PluginConfig};
use crate::error::{FpsError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

pub struct InterceptPlugin {
    domains: Vec<String>,
    session_dir: PathBuf,
    sequence: AtomicU64,
}

#[derive(Serialize)]
struct RequestRecord<'a> {
    method: &'a str,
    url: String,
    host: &'a str,
    headers: Vec<(String, String)>,
}

#[derive(Serialize)]
struct ResponseRecord<'a> {
    status: u16,
    content_type: &'a str,
    headers: Vec<(String, String)>,
}

impl InterceptPlugin {
    pub fn new(config: &PluginConfig) -> Result<Self> {
        let base_dir = config
            .options
            .get("base_dir")
            .and_then(|v| v.as_str())
            .unwrap_or("intercepts")
            .to_string();

        // A session is one plugin lifetime; the timestamp makes repeated
        // runs land in distinct directories instead of overwriting.
        let session_ts = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let session_dir = PathBuf::from(base_dir)
            .join(&config.name)
            .join(session_ts.to_string());

        Ok(Self {
            domains: config.domains.clone(),
            session_dir,
            sequence: AtomicU64::new(1),
        })
    }

    async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.session_dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&self.session_dir).await?.permissions();
            perms.set_mode(0o700);
            fs::set_permissions(&self.session_dir, perms).await?;
        }
        Ok(())
    }

    fn extension_for(content_type: &str) -> &'static str {
        let base = content_type.split(';').next().unwrap_or("").trim();
        match base {
            "application/json" => "json",
            "application/javascript" | "text/javascript" => "js",
            "application/xml" | "text/xml" => "xml",
            "text/html" => "html",
            t if t.starts_with("text/") => "txt",
            _ => "bin",
        }
    }
}

#[async_trait]
impl Plugin for InterceptPlugin {
    fn name(&self) -> &str {
        "intercept"
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    async fn filter(&self, ctx: &FilterContext<'_>, body: Bytes) -> Result<(Bytes, FilterResult)> {
        self.ensure_dir().await?;
        let n = self.sequence.fetch_add(1, Ordering::Relaxed);
        let prefix = format!("{n:03}");

        let headers: Vec<(String, String)> = ctx
            .request_headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let req = RequestRecord {
            method: ctx.method.as_str(),
            url: ctx.uri.to_string(),
            host: ctx.domain,
            headers,
        };
        fs::write(
            self.session_dir.join(format!("{prefix}-req.json")),
            serde_json::to_vec_pretty(&req).map_err(|e| FpsError::FilterError {
                plugin: self.name().to_string(),
                reason: e.to_string(),
            })?,
        )
        .await?;

        let content_type = ctx
            .response_headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream");

        let resp_headers: Vec<(String, String)> = ctx
            .response_headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();
        let resp = ResponseRecord {
            status: ctx.status.as_u16(),
            content_type,
            headers: resp_headers,
        };
        fs::write(
            self.session_dir.join(format!("{prefix}-resp.json")),
            serde_json::to_vec_pretty(&json!(resp)).map_err(|e| FpsError::FilterError {
                plugin: self.name().to_string(),
                reason: e.to_string(),
            })?,
        )
        .await?;

        let ext = Self::extension_for(content_type);
        fs::write(self.session_dir.join(format!("{prefix}-body.{ext}")), &body).await?;

        Ok((
            body,
            FilterResult {
                matched: true,
                modified: false,
                first_rule_name: None,
                total_count: 1,
                per_rule_counts: vec![("dump".to_string(), 1)],
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Placeholder, PluginMode};
    use http::{HeaderMap, Method, StatusCode, Uri};

    fn test_config(base_dir: &std::path::Path) -> PluginConfig {
        PluginConfig {
            name: "intercept".to_string(),
            enabled: true,
            mode: PluginMode::Intercept,
            placeholder: Placeholder::None,
            domains: vec![],
            priority: 0,
            options: json!({"base_dir": base_dir.to_string_lossy()}),
        }
    }

    #[tokio::test]
    async fn writes_three_files_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = InterceptPlugin::new(&test_config(dir.path())).unwrap();

        let uri: Uri = "/page".parse().unwrap();
        let method = Method::GET;
        let req_headers = HeaderMap::new();
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(http::header::CONTENT_TYPE, "text/html".parse().unwrap());

        let ctx = FilterContext {
            domain: "example.com",
            method: &method,
            uri: &uri,
            request_headers: &req_headers,
            status: StatusCode::OK,
            response_headers: &resp_headers,
        };

        let (body, result) = plugin.filter(&ctx, Bytes::from_static(b"<html></html>")).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"<html></html>"));
        assert!(result.matched);
        assert!(!result.modified);

        let mut entries = tokio::fs::read_dir(&plugin.session_dir).await.unwrap();
        let mut names = vec![];
        while let Some(e) = entries.next_entry().await.unwrap() {
            names.push(e.file_name().into_string().unwrap());
        }
        assert!(names.iter().any(|n| n.ends_with("req.json")));
        assert!(names.iter().any(|n| n.ends_with("resp.json")));
        assert!(names.iter().any(|n| n.ends_with("body.html")));
    }

    #[test]
    fn extension_inference_matches_spec_categories() {
        assert_eq!(InterceptPlugin::extension_for("application/json"), "json");
        assert_eq!(InterceptPlugin::extension_for("application/javascript"), "js");
        assert_eq!(InterceptPlugin::extension_for("application/xml"), "xml");
        assert_eq!(InterceptPlugin::extension_for("text/html; charset=utf-8"), "html");
        assert_eq!(InterceptPlugin::extension_for("text/plain"), "txt");
        assert_eq!(InterceptPlugin::extension_for("image/png"), "bin");
    }
}
