//! Tracing span shape for one dispatched request.
//!
//! Kept separate from [`super::metrics`] because spans and metrics answer
//! different questions (what happened on this one request vs. aggregate
//! rates) even though both are driven from the same `on_start`/
//! `on_complete`/`on_error` call sites in [`crate::executor`].

use tracing::Span;

use crate::envelope::ErrorKind;
use crate::registry::spec::LoggingConfig;

/// Opens the span a dispatched request runs inside. Entered for the
/// lifetime of the dispatch future so every log line emitted underneath -
/// coercion failures, worker protocol errors, lifecycle hook failures -
/// is automatically tagged with the request's identity.
pub fn request_span(request_id: &str, trace_id: Option<&str>, name: &str, version: &str) -> Span {
    tracing::info_span!(
        "algorithm.dispatch",
        request_id = %request_id,
        trace_id = trace_id.unwrap_or("-"),
        algo_name = %name,
        algo_version = %version,
        outcome = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    )
}

pub fn record_success(span: &Span, duration_ms: f64) {
    span.record("outcome", "success");
    span.record("duration_ms", duration_ms);
}

pub fn record_error(span: &Span, kind: ErrorKind, duration_ms: f64) {
    span.record("outcome", kind_label(kind));
    span.record("duration_ms", duration_ms);
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

/// Emits the input/output payload log lines a spec's [`LoggingConfig`]
/// asks for (`spec.md` §3/§4.7). A no-op whenever logging is disabled for
/// the spec, the request fell outside an `on_error_only` spec's sampled
/// outcome, or the per-request sample didn't land.
pub fn log_payloads(
    logging: &LoggingConfig,
    request_id: &str,
    algo_name: &str,
    algo_version: &str,
    is_error: bool,
    input: &serde_json::Value,
    output: Option<&serde_json::Value>,
) {
    if !logging.enabled {
        return;
    }
    if logging.on_error_only && !is_error {
        return;
    }
    if !sampled(logging.sample_rate, request_id) {
        return;
    }
    if logging.log_input {
        tracing::info!(
            request_id = %request_id,
            algo_name = %algo_name,
            algo_version = %algo_version,
            input = %render_payload(input, logging),
            "algorithm input",
        );
    }
    if logging.log_output {
        if let Some(output) = output {
            tracing::info!(
                request_id = %request_id,
                algo_name = %algo_name,
                algo_version = %algo_version,
                output = %render_payload(output, logging),
                "algorithm output",
            );
        }
    }
}

/// Deterministic per-request sampling keyed off `request_id` rather than a
/// process-wide RNG - two calls for the same request always agree, and the
/// decision doesn't depend on call order across concurrent requests.
fn sampled(sample_rate: f64, request_id: &str) -> bool {
    if sample_rate >= 1.0 {
        return true;
    }
    if sample_rate <= 0.0 {
        return false;
    }
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    request_id.hash(&mut hasher);
    let bucket = (hasher.finish() % 1_000_000) as f64 / 1_000_000.0;
    bucket < sample_rate
}

fn render_payload(value: &serde_json::Value, logging: &LoggingConfig) -> String {
    let mut redacted = value.clone();
    if let serde_json::Value::Object(map) = &mut redacted {
        for field in &logging.redact_fields {
            if let Some(slot) = map.get_mut(field) {
                *slot = serde_json::Value::String("***redacted***".to_string());
            }
        }
    }
    let mut rendered = redacted.to_string();
    if rendered.len() > logging.max_payload_length {
        rendered.truncate(floor_char_boundary(&rendered, logging.max_payload_length));
        rendered.push_str("...(truncated)");
    }
    rendered
}

/// The largest byte index `<= max_len` that lands on a UTF-8 char
/// boundary in `s`. `String::truncate` panics on a non-boundary index -
/// with `panic = "abort"` in the release profile that would abort the
/// whole service, so payloads with multi-byte characters straddling
/// `max_payload_length` must round down instead.
fn floor_char_boundary(s: &str, max_len: usize) -> usize {
    let mut boundary = max_len.min(s.len());
    while boundary > 0 && !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(overrides: impl FnOnce(&mut LoggingConfig)) -> LoggingConfig {
        let mut cfg = LoggingConfig::default();
        overrides(&mut cfg);
        cfg
    }

    #[test]
    fn disabled_logging_never_samples() {
        let cfg = logging(|c| c.enabled = false);
        assert!(!sampled(cfg.sample_rate, "r1") || !cfg.enabled);
    }

    #[test]
    fn full_sample_rate_always_samples() {
        assert!(sampled(1.0, "any-request-id"));
    }

    #[test]
    fn zero_sample_rate_never_samples() {
        assert!(!sampled(0.0, "any-request-id"));
    }

    #[test]
    fn sampling_decision_is_deterministic_per_request_id() {
        assert_eq!(sampled(0.5, "stable-id"), sampled(0.5, "stable-id"));
    }

    #[test]
    fn redact_fields_are_masked_before_rendering() {
        let cfg = logging(|c| c.redact_fields = vec!["password".to_string()]);
        let rendered = render_payload(&serde_json::json!({"password": "hunter2", "user": "alice"}), &cfg);
        assert!(rendered.contains("***redacted***"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("alice"));
    }

    #[test]
    fn payload_longer_than_max_length_is_truncated() {
        let cfg = logging(|c| c.max_payload_length = 10);
        let rendered = render_payload(&serde_json::json!({"value": "0123456789abcdef"}), &cfg);
        assert!(rendered.ends_with("...(truncated)"));
    }

    #[test]
    fn truncation_of_multibyte_payload_does_not_panic_on_char_boundary() {
        // Each "🦀" is 4 bytes; a naive byte-index truncate at an odd
        // length would split one in half and panic.
        let value = serde_json::json!({"value": "🦀🦀🦀🦀🦀"});
        let rendered_len = value.to_string().len();
        for max_len in 0..rendered_len {
            let cfg = logging(|c| c.max_payload_length = max_len);
            let rendered = render_payload(&value, &cfg);
            assert!(rendered.ends_with("...(truncated)"));
        }
    }
}
