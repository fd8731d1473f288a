use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::model::ModelKey;

const LATENCY_BUCKETS: [f64; 7] = [0.5, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0];

/// Generation counters, owned by the server state rather than a global registry.
pub struct GenerationMetrics {
    registry: Registry,
    requests: IntCounterVec,
    failures: IntCounterVec,
    latency: HistogramVec,
    // Requests are never queued, so this stays at zero. Exported because
    // existing dashboards scrape it.
    queue_depth: IntGauge,
}

impl GenerationMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("gen_requests_total", "Total generation requests"),
            &["model"],
        )?;
        let failures = IntCounterVec::new(
            Opts::new("gen_failures_total", "Total generation failures"),
            &["model"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("gen_latency_seconds", "Generation latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["model"],
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Requests in queue")?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            requests,
            failures,
            latency,
            queue_depth,
        })
    }

    pub fn record_request(&self, model_key: ModelKey) {
        self.requests
            .with_label_values(&[model_key.as_str()])
            .inc();
    }

    pub fn record_failure(&self, model_key: ModelKey) {
        self.failures
            .with_label_values(&[model_key.as_str()])
            .inc();
    }

    /// Observes on drop, so failed generations are timed as well.
    pub fn start_timer(&self, model_key: ModelKey) -> HistogramTimer {
        self.latency
            .with_label_values(&[model_key.as_str()])
            .start_timer()
    }

    pub fn queue_depth(&self) -> i64 {
        self.queue_depth.get()
    }

    /// Prometheus text exposition of everything registered
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not UTF-8")
    }
}

pub fn content_type() -> String {
    TextEncoder::new().format_type().to_string()
}
