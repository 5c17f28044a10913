//! Request metrics collection
//!
//! Prometheus counters and a latency histogram kept in a private registry,
//! fed by request events. Thread-safe; every operation is lock-free apart
//! from the label lookups inside `prometheus`.

use crate::cache::CacheStats;
use crate::events::{EventRecorder, RequestEvent};
use crate::models::CacheOutcome;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

const OUTCOMES: [CacheOutcome; 4] = [
    CacheOutcome::Hit,
    CacheOutcome::Miss,
    CacheOutcome::Bypass,
    CacheOutcome::None,
];

/// Metrics collector for the server
#[derive(Clone)]
pub struct ServerMetrics {
    registry: Registry,
    responses: IntCounterVec,
    cache_outcomes: IntCounterVec,
    bytes_sent: IntCounter,
    partial_transfers: IntCounter,
    latency: Histogram,
    cache_entries: IntGauge,
    cache_bytes: IntGauge,
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_bypasses: u64,
    pub bytes_sent: u64,
    pub partial_transfers: u64,
    pub total_latency_secs: f64,
}

impl MetricsSnapshot {
    /// Hit rate among requests that consulted the cache (0.0 to 100.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }

    /// Average request latency in milliseconds
    pub fn avg_latency_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_latency_secs / self.total_requests as f64 * 1000.0
        }
    }
}

impl ServerMetrics {
    /// Create metrics registered in a fresh private registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let responses = IntCounterVec::new(
            Opts::new("static_cache_responses_total", "Responses sent, by status code"),
            &["status"],
        )?;
        registry.register(Box::new(responses.clone()))?;

        let cache_outcomes = IntCounterVec::new(
            Opts::new("static_cache_requests_total", "Requests served, by cache outcome"),
            &["cache"], // hit, miss, bypass, none
        )?;
        registry.register(Box::new(cache_outcomes.clone()))?;

        let bytes_sent = IntCounter::new(
            "static_cache_bytes_sent_total",
            "Response body bytes written to clients",
        )?;
        registry.register(Box::new(bytes_sent.clone()))?;

        let partial_transfers = IntCounter::new(
            "static_cache_partial_transfers_total",
            "Responses whose body transfer was cut short",
        )?;
        registry.register(Box::new(partial_transfers.clone()))?;

        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "static_cache_request_duration_seconds",
                "Time from parsed request head to finished response",
            )
            .buckets(vec![
                0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;
        registry.register(Box::new(latency.clone()))?;

        let cache_entries = IntGauge::new("static_cache_entries", "Entries currently cached")?;
        registry.register(Box::new(cache_entries.clone()))?;

        let cache_bytes = IntGauge::new("static_cache_bytes", "Body bytes currently cached")?;
        registry.register(Box::new(cache_bytes.clone()))?;

        Ok(ServerMetrics {
            registry,
            responses,
            cache_outcomes,
            bytes_sent,
            partial_transfers,
            latency,
            cache_entries,
            cache_bytes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Number of responses sent with a given status
    pub fn status_count(&self, status: u16) -> u64 {
        self.responses.with_label_values(&[&status.to_string()]).get()
    }

    /// Copy current cache occupancy into the gauges
    pub fn observe_cache(&self, stats: &CacheStats) {
        self.cache_entries.set(stats.entries as i64);
        self.cache_bytes.set(stats.total_bytes as i64);
    }

    /// Get a snapshot of current metrics
    pub fn get_stats(&self) -> MetricsSnapshot {
        let outcome = |o: CacheOutcome| self.cache_outcomes.with_label_values(&[o.as_str()]).get();

        MetricsSnapshot {
            total_requests: OUTCOMES.iter().map(|o| outcome(*o)).sum(),
            cache_hits: outcome(CacheOutcome::Hit),
            cache_misses: outcome(CacheOutcome::Miss),
            cache_bypasses: outcome(CacheOutcome::Bypass),
            bytes_sent: self.bytes_sent.get(),
            partial_transfers: self.partial_transfers.get(),
            total_latency_secs: self.latency.get_sample_sum(),
        }
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl EventRecorder for ServerMetrics {
    fn record(&self, event: &RequestEvent) {
        self.responses
            .with_label_values(&[&event.status.to_string()])
            .inc();
        self.cache_outcomes
            .with_label_values(&[event.cache.as_str()])
            .inc();
        self.bytes_sent.inc_by(event.bytes_sent);
        if !event.complete {
            self.partial_transfers.inc();
        }
        self.latency.observe(event.latency.as_secs_f64());
    }
}
