//! Stats callback surface exposed to the external stats DB / dashboard
//! collaborator. The core calls these at well-defined points;
//! it never depends on how they're persisted.

use crate::metrics::Metrics;
use std::sync::Arc;
use tracing::debug;

/// Named interface the external stats DB/dashboard collaborator
/// implements against. The default implementation records into
/// Prometheus; tests use the no-op implementation.
pub trait StatsSink: Send + Sync {
    fn on_request(&self, client_ip: &str, domain: &str, blocked: bool, bytes_in: u64, bytes_out: u64);
    fn on_tunnel_close(&self, client_ip: &str, bytes_in: u64, bytes_out: u64);
    fn on_mitm_request(&self, client_ip: &str, domain: &str);
    fn on_plugin_inspect(&self, plugin: &str);
    fn on_plugin_match(&self, plugin: &str, rule: &str, modified: bool, removed_count: u64);

    fn on_transparent_http(&self);
    fn on_transparent_tls(&self);
    fn on_transparent_mitm(&self);
    fn on_transparent_block(&self);
    fn on_sni_missing(&self);
}

/// Prometheus-backed implementation, the default wired by `main.rs`.
pub struct PrometheusStatsSink {
    metrics: Arc<Metrics>,
}

impl PrometheusStatsSink {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl StatsSink for PrometheusStatsSink {
    fn on_request(&self, client_ip: &str, domain: &str, blocked: bool, bytes_in: u64, bytes_out: u64) {
        debug!(client_ip, domain, blocked, bytes_in, bytes_out, "request");
        self.metrics.record_request(blocked);
        self.metrics.bytes_in_total.inc_by(bytes_in);
        self.metrics.bytes_out_total.inc_by(bytes_out);
    }

    fn on_tunnel_close(&self, client_ip: &str, bytes_in: u64, bytes_out: u64) {
        debug!(client_ip, bytes_in, bytes_out, "tunnel closed");
        self.metrics.tunnels_closed.inc();
        self.metrics.tunnel_bytes_in.inc_by(bytes_in);
        self.metrics.tunnel_bytes_out.inc_by(bytes_out);
    }

    fn on_mitm_request(&self, client_ip: &str, domain: &str) {
        debug!(client_ip, domain, "mitm request");
        self.metrics.mitm_requests.inc();
    }

    fn on_plugin_inspect(&self, plugin: &str) {
        self.metrics.record_plugin_inspect(plugin);
    }

    fn on_plugin_match(&self, plugin: &str, rule: &str, modified: bool, removed_count: u64) {
        debug!(plugin, rule, modified, removed_count, "plugin match");
        self.metrics.record_plugin_match(plugin, rule, modified);
    }

    fn on_transparent_http(&self) {
        self.metrics.transparent_http.inc();
    }

    fn on_transparent_tls(&self) {
        self.metrics.transparent_tls.inc();
    }

    fn on_transparent_mitm(&self) {
        self.metrics.transparent_mitm.inc();
    }

    fn on_transparent_block(&self) {
        self.metrics.transparent_block.inc();
    }

    fn on_sni_missing(&self) {
        self.metrics.sni_missing.inc();
    }
}

/// No-op sink for unit/integration tests that don't care about stats.
#[derive(Default)]
pub struct NoopStatsSink;

impl StatsSink for NoopStatsSink {
    fn on_request(&self, _: &str, _: &str, _: bool, _: u64, _: u64) {}
    fn on_tunnel_close(&self, _: &str, _: u64, _: u64) {}
    fn on_mitm_request(&self, _: &str, _: &str) {}
    fn on_plugin_inspect(&self, _: &str) {}
    fn on_plugin_match(&self, _: &str, _: &str, _: bool, _: u64) {}
    fn on_transparent_http(&self) {}
    fn on_transparent_tls(&self) {}
    fn on_transparent_mitm(&self) {}
    fn on_transparent_block(&self) {}
    fn on_sni_missing(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prometheus_sink_records_request_bytes() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let sink = PrometheusStatsSink::new(metrics.clone());
        sink.on_request("127.0.0.1", "example.com", false, 100, 200);
        let exported = metrics.export().unwrap();
        assert!(exported.contains("fps_bytes_in_total 100"));
        assert!(exported.contains("fps_bytes_out_total 200"));
    }

    #[test]
    fn noop_sink_does_not_panic() {
        let sink = NoopStatsSink;
        sink.on_request("x", "y", true, 0, 0);
        sink.on_tunnel_close("x", 0, 0);
        sink.on_sni_missing();
    }
}
