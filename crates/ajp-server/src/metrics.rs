// SPDX-License-Identifier: Apache-2.0
//! Prometheus metrics for the AJP connector.

use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global metrics registry singleton.
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_active: Gauge,
    pub connections_total: CounterVec,

    // Protocol metrics
    pub messages_total: CounterVec,
    pub receive_failures_total: CounterVec,

    // Authentication metrics
    pub auth_requests_total: CounterVec,
    pub auth_duration_seconds: HistogramVec,
    pub lockout_cached_users: Gauge,

    // Realm metrics
    pub realm_reload_total: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        // Connection metrics
        let connections_active = Gauge::with_opts(Opts::new(
            "ajp_connections_active",
            "Number of open AJP connections",
        ))
        .expect("metric can be created");

        let connections_total = CounterVec::new(
            Opts::new("ajp_connections_total", "AJP connections by outcome"),
            &["status"],
        )
        .expect("metric can be created");

        // Protocol metrics
        let messages_total = CounterVec::new(
            Opts::new("ajp_messages_total", "Inbound AJP messages by type"),
            &["type"],
        )
        .expect("metric can be created");

        let receive_failures_total = CounterVec::new(
            Opts::new(
                "ajp_receive_failures_total",
                "Connection-terminating receive failures by status code",
            ),
            &["code"],
        )
        .expect("metric can be created");

        // Authentication metrics
        let auth_requests_total = CounterVec::new(
            Opts::new(
                "ajp_auth_requests_total",
                "Realm authentications by result",
            ),
            &["result"],
        )
        .expect("metric can be created");

        let auth_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ajp_auth_duration_seconds",
                "Realm authentication duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
            &["result"],
        )
        .expect("metric can be created");

        let lockout_cached_users = Gauge::with_opts(Opts::new(
            "ajp_lockout_cached_users",
            "Usernames currently holding a failure record",
        ))
        .expect("metric can be created");

        let realm_reload_total = CounterVec::new(
            Opts::new("ajp_realm_reload_total", "Users file reloads by result"),
            &["result"],
        )
        .expect("metric can be created");

        // Register all metrics
        registry
            .register(Box::new(connections_active.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(connections_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(messages_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(receive_failures_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(auth_requests_total.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(auth_duration_seconds.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(lockout_cached_users.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(realm_reload_total.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            connections_active,
            connections_total,
            messages_total,
            receive_failures_total,
            auth_requests_total,
            auth_duration_seconds,
            lockout_cached_users,
            realm_reload_total,
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_default()
    }
}

/// Records one realm authentication: duration and result.
pub struct AuthTimer {
    start: std::time::Instant,
}

impl AuthTimer {
    pub fn new() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    pub fn finish(self, result: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        metrics()
            .auth_duration_seconds
            .with_label_values(&[result])
            .observe(duration);
        metrics()
            .auth_requests_total
            .with_label_values(&[result])
            .inc();
    }
}

impl Default for AuthTimer {
    fn default() -> Self {
        Self::new()
    }
}
