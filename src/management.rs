//! Management router: `<prefix>/heartbeat`, `<prefix>/stats`,
//! `<prefix>/ca.pem`, plus `<prefix>/config/reload` for the hot-reload
//! trigger. Dashboard/WebSocket routes are mounted by the
//! external collaborator under the same prefix; this module only owns
//! the core's named interface.

use crate::ca::CertAuthority;
use crate::config_reload::ConfigReloader;
use crate::domain::DomainMatcher;
use crate::metrics::Metrics;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::SystemTime;
use tower_http::cors::CorsLayer;
use tracing::warn;

#[derive(Clone)]
struct ManagementState {
    matcher: Arc<DomainMatcher>,
    metrics: Arc<Metrics>,
    ca: Option<Arc<CertAuthority>>,
    config_reloader: Option<Arc<ConfigReloader>>,
    startup_time: SystemTime,
}

/// Build the management router, to be nested under `config.management_prefix`
/// by the binary's axum app.
pub fn router(
    matcher: Arc<DomainMatcher>,
    metrics: Arc<Metrics>,
    ca: Option<Arc<CertAuthority>>,
    config_reloader: Option<Arc<ConfigReloader>>,
) -> Router {
    let state = ManagementState {
        matcher,
        metrics,
        ca,
        config_reloader,
        startup_time: SystemTime::now(),
    };

    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/stats", get(stats))
        .route("/ca.pem", get(ca_pem))
        .route("/config/reload", post(reload_config))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

async fn heartbeat(State(state): State<ManagementState>) -> impl IntoResponse {
    let uptime = state
        .startup_time
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or(0);
    Json(json!({ "status": "ok", "uptime_secs": uptime }))
}

async fn stats(State(state): State<ManagementState>) -> impl IntoResponse {
    state
        .metrics
        .update_domain_stats(state.matcher.blocklist_len(), state.matcher.allowlist_len());

    match state.metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "failed to export metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the CA's PEM when MITM is enabled; 404 otherwise.
async fn ca_pem(State(state): State<ManagementState>) -> Response {
    match &state.ca {
        Some(ca) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/x-pem-file")
            .body(Body::from(ca.pem_bytes.clone()))
            .unwrap(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn reload_config(State(state): State<ManagementState>) -> Response {
    match &state.config_reloader {
        Some(reloader) => match reloader.reload_now().await {
            Ok(()) => Json(json!({ "status": "reloaded" })).into_response(),
            Err(e) => (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
        },
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use tower::ServiceExt;

    #[tokio::test]
    async fn heartbeat_returns_ok() {
        let matcher = Arc::new(DomainMatcher::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let app = router(matcher, metrics, None, None);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/heartbeat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ca_pem_is_404_without_ca() {
        let matcher = Arc::new(DomainMatcher::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let app = router(matcher, metrics, None, None);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/ca.pem").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn ca_pem_serves_pem_when_mitm_enabled() {
        let matcher = Arc::new(DomainMatcher::new());
        let metrics = Arc::new(Metrics::new().unwrap());
        let ca = Arc::new(CertAuthority::generate("Face Puncher Supreme Test CA").unwrap());
        let app = router(matcher, metrics, Some(ca), None);

        let response = app
            .oneshot(axum::http::Request::builder().uri("/ca.pem").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap().clone();
        assert_eq!(content_type, "application/x-pem-file");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }
}
