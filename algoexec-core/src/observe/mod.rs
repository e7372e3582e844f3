//! Observation recorder (C7): metrics + tracing spans for every dispatched
//! request.

pub mod metrics;
pub mod tracing_recorder;

pub use metrics::AlgorithmMetrics;

use std::sync::Arc;
use std::time::Instant;

use tracing::Span;

use crate::envelope::ErrorKind;

/// Shared recorder handle threaded through [`crate::executor::Executor`].
#[derive(Clone)]
pub struct Recorder {
    metrics: Arc<AlgorithmMetrics>,
}

/// A started-but-not-yet-finished observation, returned by
/// [`Recorder::start`]. Exactly one of [`Observation::complete`] /
/// [`Observation::fail`] must be called to close it out.
pub struct Observation {
    name: String,
    version: String,
    started_at: Instant,
    span: Span,
}

impl Observation {
    /// The span this observation records into - clone it onto whatever
    /// future does the actual dispatch so logs emitted underneath nest
    /// under `algorithm.dispatch` instead of floating free.
    pub fn span(&self) -> Span {
        self.span.clone()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            metrics: Arc::new(AlgorithmMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<AlgorithmMetrics> {
        self.metrics.clone()
    }

    pub fn start(&self, request_id: &str, trace_id: Option<&str>, name: &str, version: &str) -> Observation {
        self.metrics.on_start(name, version);
        let span = tracing_recorder::request_span(request_id, trace_id, name, version);
        Observation {
            name: name.to_string(),
            version: version.to_string(),
            started_at: Instant::now(),
            span,
        }
    }

    pub fn complete(&self, observation: Observation) -> f64 {
        let duration_ms = observation.started_at.elapsed().as_secs_f64() * 1000.0;
        self.metrics.on_complete(&observation.name, &observation.version, duration_ms);
        tracing_recorder::record_success(&observation.span, duration_ms);
        duration_ms
    }

    pub fn fail(&self, observation: Observation, kind: ErrorKind) -> f64 {
        let duration_ms = observation.started_at.elapsed().as_secs_f64() * 1000.0;
        self.metrics.on_error(&observation.name, &observation.version, kind, duration_ms);
        tracing_recorder::record_error(&observation.span, kind, duration_ms);
        duration_ms
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}
