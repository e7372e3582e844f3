//! Request metrics: counters, gauges, and a fixed-bucket latency
//! histogram, exposed as Prometheus text and as an OpenTelemetry-shaped
//! JSON snapshot.
//!
//! Bucket bounds are bit-exact with the Python original's
//! `DEFAULT_LATENCY_BUCKETS_MS`.

use prometheus::{
    CounterVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde_json::{json, Value};

use crate::envelope::ErrorKind;

pub const LATENCY_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Tracks in-flight/completed/errored request counts and latency per
/// `(algo_name, algo_version)`, and renders Prometheus/OTel exports.
pub struct AlgorithmMetrics {
    registry: Registry,
    in_flight: IntGaugeVec,
    completed: CounterVec,
    errors: CounterVec,
    latency_ms: HistogramVec,
    queue_wait_ms: HistogramVec,
}

impl AlgorithmMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let in_flight = IntGaugeVec::new(
            Opts::new("algo_requests_in_flight", "Requests currently executing"),
            &["algo_name", "algo_version"],
        )
        .expect("static metric definition");

        let completed = CounterVec::new(
            Opts::new("algo_requests_completed_total", "Completed requests"),
            &["algo_name", "algo_version", "outcome"],
        )
        .expect("static metric definition");

        let errors = CounterVec::new(
            Opts::new("algo_requests_error_total", "Errored requests by kind"),
            &["algo_name", "algo_version", "kind"],
        )
        .expect("static metric definition");

        let latency_ms = HistogramVec::new(
            HistogramOpts::new("algo_request_duration_ms", "Request latency in milliseconds")
                .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["algo_name", "algo_version"],
        )
        .expect("static metric definition");

        let queue_wait_ms = HistogramVec::new(
            HistogramOpts::new(
                "algo_request_queue_wait_ms",
                "Time a process-pool request spent waiting for a worker, in milliseconds",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["algo_name", "algo_version"],
        )
        .expect("static metric definition");

        registry.register(Box::new(in_flight.clone())).unwrap();
        registry.register(Box::new(completed.clone())).unwrap();
        registry.register(Box::new(errors.clone())).unwrap();
        registry.register(Box::new(latency_ms.clone())).unwrap();
        registry.register(Box::new(queue_wait_ms.clone())).unwrap();

        Self {
            registry,
            in_flight,
            completed,
            errors,
            latency_ms,
            queue_wait_ms,
        }
    }

    pub fn on_start(&self, name: &str, version: &str) {
        self.in_flight.with_label_values(&[name, version]).inc();
    }

    pub fn on_complete(&self, name: &str, version: &str, duration_ms: f64) {
        self.in_flight.with_label_values(&[name, version]).dec();
        self.completed
            .with_label_values(&[name, version, "success"])
            .inc();
        self.latency_ms
            .with_label_values(&[name, version])
            .observe(duration_ms);
    }

    pub fn on_error(&self, name: &str, version: &str, kind: ErrorKind, duration_ms: f64) {
        self.in_flight.with_label_values(&[name, version]).dec();
        self.completed
            .with_label_values(&[name, version, "error"])
            .inc();
        self.errors
            .with_label_values(&[name, version, kind_label(kind)])
            .inc();
        self.latency_ms
            .with_label_values(&[name, version])
            .observe(duration_ms);
    }

    /// Records how long a process-pool request waited for a free worker
    /// before it started running (`spec.md` §4.7's `queue_wait_ms`
    /// histogram). In-process dispatches never queue, so this is only
    /// fed from [`crate::pool::supervisor::WorkerPool`].
    pub fn observe_queue_wait(&self, name: &str, version: &str, wait_ms: f64) {
        self.queue_wait_ms
            .with_label_values(&[name, version])
            .observe(wait_ms);
    }

    pub fn render_prometheus_text(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = String::new();
        encoder
            .encode_utf8(&families, &mut buffer)
            .expect("in-memory text encoding cannot fail");
        buffer
    }

    /// A minimal OpenTelemetry-shaped JSON snapshot: one data point per
    /// metric family per label set, attributes rendered the same way the
    /// Python original's `build_otel_metrics` did
    /// (`{"key": "...", "value": {"stringValue": "..."}}`).
    pub fn snapshot_otel(&self) -> Value {
        let families = self.registry.gather();
        let metrics: Vec<Value> = families
            .iter()
            .flat_map(|family| {
                let name = family.get_name().to_string();
                family.get_metric().iter().map(move |metric| {
                    let attributes: Vec<Value> = metric
                        .get_label()
                        .iter()
                        .map(|label| {
                            json!({
                                "key": label.get_name(),
                                "value": {"stringValue": label.get_value()},
                            })
                        })
                        .collect();
                    let value = if metric.has_counter() {
                        json!({"asDouble": metric.get_counter().get_value()})
                    } else if metric.has_gauge() {
                        json!({"asDouble": metric.get_gauge().get_value()})
                    } else if metric.has_histogram() {
                        let histogram = metric.get_histogram();
                        json!({
                            "count": histogram.get_sample_count(),
                            "sum": histogram.get_sample_sum(),
                        })
                    } else {
                        Value::Null
                    };
                    json!({"name": name.clone(), "attributes": attributes, "value": value})
                })
            })
            .collect();
        json!({"metrics": metrics})
    }
}

impl Default for AlgorithmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "validation",
        ErrorKind::Timeout => "timeout",
        ErrorKind::Rejected => "rejected",
        ErrorKind::Runtime => "runtime",
        ErrorKind::System => "system",
    }
}
