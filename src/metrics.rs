//! Prometheus metrics registry for the proxy core.
//!
//! Covers every stats callback a collaborator (dashboard, alerting) might
//! want exposed, plus the transparent-listener counters. This is the
//! default `StatsSink` backend (see `stats.rs`).

use prometheus::{CounterVec, Encoder, IntCounter, IntGauge, Registry, TextEncoder, opts};

pub struct Metrics {
    registry: Registry,

    pub requests_total: CounterVec,
    pub requests_blocked: IntCounter,
    pub bytes_in_total: IntCounter,
    pub bytes_out_total: IntCounter,

    pub active_connections: IntGauge,
    pub tunnels_closed: IntCounter,
    pub tunnel_bytes_in: IntCounter,
    pub tunnel_bytes_out: IntCounter,

    pub mitm_requests: IntCounter,
    pub mitm_sessions_active: IntGauge,

    pub plugin_responses_inspected: CounterVec,
    pub plugin_responses_matched: CounterVec,
    pub plugin_responses_modified: CounterVec,
    pub plugin_rule_hits: CounterVec,

    pub transparent_http: IntCounter,
    pub transparent_tls: IntCounter,
    pub transparent_mitm: IntCounter,
    pub transparent_block: IntCounter,
    pub sni_missing: IntCounter,

    pub blocklist_size: IntGauge,
    pub allowlist_size: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            opts!("fps_requests_total", "Total proxied requests by domain outcome"),
            &["blocked"],
        )?;
        let requests_blocked = IntCounter::with_opts(opts!(
            "fps_requests_blocked_total",
            "Total requests refused because the domain was blocked"
        ))?;
        let bytes_in_total = IntCounter::with_opts(opts!(
            "fps_bytes_in_total",
            "Total bytes read from clients across all paths"
        ))?;
        let bytes_out_total = IntCounter::with_opts(opts!(
            "fps_bytes_out_total",
            "Total bytes written to clients across all paths"
        ))?;

        let active_connections = IntGauge::with_opts(opts!(
            "fps_active_connections",
            "Connections currently being handled"
        ))?;
        let tunnels_closed = IntCounter::with_opts(opts!(
            "fps_tunnels_closed_total",
            "Total CONNECT tunnels that have closed"
        ))?;
        let tunnel_bytes_in = IntCounter::with_opts(opts!(
            "fps_tunnel_bytes_in_total",
            "Bytes relayed client to upstream over raw tunnels"
        ))?;
        let tunnel_bytes_out = IntCounter::with_opts(opts!(
            "fps_tunnel_bytes_out_total",
            "Bytes relayed upstream to client over raw tunnels"
        ))?;

        let mitm_requests = IntCounter::with_opts(opts!(
            "fps_mitm_requests_total",
            "Total HTTP requests served inside intercepted TLS sessions"
        ))?;
        let mitm_sessions_active = IntGauge::with_opts(opts!(
            "fps_mitm_sessions_active",
            "MITM sessions currently in their proxy loop"
        ))?;

        let plugin_responses_inspected = CounterVec::new(
            opts!("fps_plugin_responses_inspected_total", "Responses seen by a plugin"),
            &["plugin"],
        )?;
        let plugin_responses_matched = CounterVec::new(
            opts!("fps_plugin_responses_matched_total", "Responses a plugin reported matched"),
            &["plugin"],
        )?;
        let plugin_responses_modified = CounterVec::new(
            opts!("fps_plugin_responses_modified_total", "Responses a plugin actually rewrote"),
            &["plugin"],
        )?;
        let plugin_rule_hits = CounterVec::new(
            opts!("fps_plugin_rule_hits_total", "Per-rule hit counts, keyed plugin:rule"),
            &["plugin", "rule"],
        )?;

        let transparent_http = IntCounter::with_opts(opts!(
            "fps_transparent_http_total",
            "Connections handled by the transparent HTTP listener"
        ))?;
        let transparent_tls = IntCounter::with_opts(opts!(
            "fps_transparent_tls_total",
            "Connections handled by the transparent HTTPS listener"
        ))?;
        let transparent_mitm = IntCounter::with_opts(opts!(
            "fps_transparent_mitm_total",
            "Transparent connections handed to the MITM engine"
        ))?;
        let transparent_block = IntCounter::with_opts(opts!(
            "fps_transparent_block_total",
            "Transparent connections closed because the domain was blocked"
        ))?;
        let sni_missing = IntCounter::with_opts(opts!(
            "fps_sni_missing_total",
            "Transparent TLS connections with no SNI in the ClientHello"
        ))?;

        let blocklist_size =
            IntGauge::with_opts(opts!("fps_blocklist_size", "Domains currently in the blocklist"))?;
        let allowlist_size =
            IntGauge::with_opts(opts!("fps_allowlist_size", "Entries currently in the allowlist"))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(requests_blocked.clone()))?;
        registry.register(Box::new(bytes_in_total.clone()))?;
        registry.register(Box::new(bytes_out_total.clone()))?;
        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(tunnels_closed.clone()))?;
        registry.register(Box::new(tunnel_bytes_in.clone()))?;
        registry.register(Box::new(tunnel_bytes_out.clone()))?;
        registry.register(Box::new(mitm_requests.clone()))?;
        registry.register(Box::new(mitm_sessions_active.clone()))?;
        registry.register(Box::new(plugin_responses_inspected.clone()))?;
        registry.register(Box::new(plugin_responses_matched.clone()))?;
        registry.register(Box::new(plugin_responses_modified.clone()))?;
        registry.register(Box::new(plugin_rule_hits.clone()))?;
        registry.register(Box::new(transparent_http.clone()))?;
        registry.register(Box::new(transparent_tls.clone()))?;
        registry.register(Box::new(transparent_mitm.clone()))?;
        registry.register(Box::new(transparent_block.clone()))?;
        registry.register(Box::new(sni_missing.clone()))?;
        registry.register(Box::new(blocklist_size.clone()))?;
        registry.register(Box::new(allowlist_size.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            requests_blocked,
            bytes_in_total,
            bytes_out_total,
            active_connections,
            tunnels_closed,
            tunnel_bytes_in,
            tunnel_bytes_out,
            mitm_requests,
            mitm_sessions_active,
            plugin_responses_inspected,
            plugin_responses_matched,
            plugin_responses_modified,
            plugin_rule_hits,
            transparent_http,
            transparent_tls,
            transparent_mitm,
            transparent_block,
            sni_missing,
            blocklist_size,
            allowlist_size,
        })
    }

    pub fn record_request(&self, blocked: bool) {
        let label = if blocked { "true" } else { "false" };
        self.requests_total.with_label_values(&[label]).inc();
        if blocked {
            self.requests_blocked.inc();
        }
    }

    pub fn record_plugin_inspect(&self, plugin: &str) {
        self.plugin_responses_inspected.with_label_values(&[plugin]).inc();
    }

    pub fn record_plugin_match(&self, plugin: &str, rule: &str, modified: bool) {
        self.plugin_responses_matched.with_label_values(&[plugin]).inc();
        if modified {
            self.plugin_responses_modified.with_label_values(&[plugin]).inc();
        }
        self.plugin_rule_hits.with_label_values(&[plugin, rule]).inc();
    }

    pub fn update_domain_stats(&self, blocklist_len: usize, allowlist_len: usize) {
        self.blocklist_size.set(blocklist_len as i64);
        self.allowlist_size.set(allowlist_len as i64);
    }

    /// Export metrics in Prometheus text format for the management `/stats` route.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }
}
