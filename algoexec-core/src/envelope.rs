//! Wire envelope and error classification (C2).
//!
//! [`AlgorithmRequest`]/[`AlgorithmResponse`] are the bit-exact JSON shapes
//! exchanged over HTTP (`spec.md` §6). [`ErrorKind`] is the closed,
//! wire-visible classification every internal failure collapses into
//! before it reaches a caller.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of error classifications carried on the wire.
///
/// Mapped 1:1 to HTTP status by [`ErrorKind::http_status`] -
/// `{validation: 400, timeout: 504, rejected: 429, runtime: 500, system: 500}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Rejected,
    Runtime,
    System,
}

impl ErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Timeout => 504,
            ErrorKind::Rejected => 429,
            ErrorKind::Runtime => 500,
            ErrorKind::System => 500,
        }
    }
}

/// Structured failure detail. Never serialized into the wire envelope
/// directly - it is collapsed into `code`/`message` there (`spec.md`
/// §4.2) - but carried internally and exposed to observation (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// The error type algorithm bodies and internal plumbing both produce.
///
/// Every path that can fail - coercion, the user's `run`, a worker crash,
/// a timeout - ultimately becomes one of these, then one [`ErrorDetail`].
#[derive(Debug, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct AlgoError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
}

impl AlgoError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn validation(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Validation, err.to_string())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn runtime(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Runtime, err.to_string())
    }

    pub fn system(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::System, err.to_string())
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn into_detail(self, include_traceback: bool) -> ErrorDetail {
        let traceback = if include_traceback {
            Some(format!("{:?}", anyhow::anyhow!(self.message.clone())))
        } else {
            None
        };
        ErrorDetail {
            kind: self.kind,
            message: self.message,
            details: self.details,
            traceback,
        }
    }
}

/// Ambient/free-form request identity (`spec.md` §3, §6): trace id, tenant
/// id, user id, plus anything else a caller wants to thread through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(rename = "traceId", default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(rename = "tenantId", default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

/// The inbound request envelope, bit-exact with the wire format
/// (`spec.md` §6): `requestId`, `datetime`, `context`, `data`.
///
/// `timeout_s` and `hyperparams` are additional fields beyond the
/// documented bit-exact core - see `DESIGN.md` - accepting a per-request
/// timeout override and the optional hyperparameters model `spec.md` §3
/// says a class `run` may take alongside its input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmRequest {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub datetime: String,
    #[serde(default)]
    pub context: RequestContext,
    pub data: Value,
    #[serde(rename = "timeoutS", default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperparams: Option<Value>,
}

impl AlgorithmRequest {
    pub fn new(data: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            datetime: chrono::Utc::now().to_rfc3339(),
            context: RequestContext::default(),
            data,
            timeout_s: None,
            hyperparams: None,
        }
    }
}

/// The three ambient slots an algorithm may set during `run` to override
/// the envelope the engine would otherwise build (`spec.md` §4.3): the
/// response `code`, `message`, and `context`. `None` means "use the
/// engine's default for this outcome."
///
/// `Serialize`/`Deserialize` so a worker process can snapshot its ambient
/// and send it back to the supervisor alongside the result (`spec.md`
/// §4.3: "the worker returns the final snapshot back to the supervisor
/// alongside the result").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl ResponseMeta {
    /// `true` when none of the three slots have been set - the common
    /// case, not worth serializing across the worker boundary.
    pub fn is_empty(&self) -> bool {
        self.code.is_none() && self.message.is_none() && self.context.is_none()
    }
}

/// The outbound response envelope, bit-exact with the wire format
/// (`spec.md` §6): `code`, `message`, `requestId`, `datetime`, `context`,
/// `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmResponse {
    pub code: i32,
    pub message: String,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
    pub datetime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AlgorithmResponse {
    /// Builds the success envelope. A `meta.code`/`meta.message` set by
    /// the algorithm during `run` takes precedence over the `0`/`"success"`
    /// defaults (`spec.md` §4.2, scenario S6).
    pub fn success(request: &AlgorithmRequest, result: Value, meta: ResponseMeta) -> Self {
        Self {
            code: meta.code.unwrap_or(0),
            message: meta.message.unwrap_or_else(|| "success".to_string()),
            request_id: Some(request.request_id.clone()),
            datetime: chrono::Utc::now().to_rfc3339(),
            context: meta.context.or_else(|| request_context_value(request)),
            data: Some(result),
        }
    }

    /// Builds the failure envelope. A `meta.code`/`meta.message` set by the
    /// algorithm before failing takes precedence over the mapped HTTP-style
    /// code and the error's own message (`spec.md` §4.2, scenario S6);
    /// `data` is always `null` on failure.
    pub fn failure(request: &AlgorithmRequest, error: ErrorDetail, meta: ResponseMeta) -> Self {
        Self {
            code: meta.code.unwrap_or_else(|| error.kind.http_status() as i32),
            message: meta.message.unwrap_or(error.message),
            request_id: Some(request.request_id.clone()),
            datetime: chrono::Utc::now().to_rfc3339(),
            context: meta.context.or_else(|| request_context_value(request)),
            data: None,
        }
    }

    /// Builds a response for a failure that never reached a request (e.g.
    /// a 404 for an unknown algorithm, or admission rejection before
    /// dispatch).
    pub fn unrouted(code: i32, message: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id,
            datetime: chrono::Utc::now().to_rfc3339(),
            context: None,
            data: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code != 0
    }
}

fn request_context_value(request: &AlgorithmRequest) -> Option<Value> {
    serde_json::to_value(&request.context).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_maps_to_expected_http_status() {
        assert_eq!(ErrorKind::Validation.http_status(), 400);
        assert_eq!(ErrorKind::Timeout.http_status(), 504);
        assert_eq!(ErrorKind::Rejected.http_status(), 429);
        assert_eq!(ErrorKind::Runtime.http_status(), 500);
        assert_eq!(ErrorKind::System.http_status(), 500);
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = AlgorithmRequest::new(serde_json::json!({"x": 1}));
        let encoded = serde_json::to_string(&req).unwrap();
        let decoded: AlgorithmRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.request_id, req.request_id);
        assert_eq!(decoded.data, serde_json::json!({"x": 1}));
    }

    #[test]
    fn request_context_uses_camel_case_wire_names() {
        let mut req = AlgorithmRequest::new(Value::Null);
        req.context.trace_id = Some("t-1".into());
        req.context.tenant_id = Some("tenant-1".into());
        let encoded = serde_json::to_value(&req).unwrap();
        assert_eq!(encoded["context"]["traceId"], "t-1");
        assert_eq!(encoded["context"]["tenantId"], "tenant-1");
    }

    #[test]
    fn success_response_has_code_zero_and_no_error_shape() {
        let req = AlgorithmRequest::new(Value::Null);
        let resp = AlgorithmResponse::success(&req, serde_json::json!({"ok": true}), ResponseMeta::default());
        assert!(!resp.is_error());
        assert_eq!(resp.code, 0);
        assert_eq!(resp.message, "success");
        assert!(resp.data.is_some());
    }

    #[test]
    fn failure_response_never_carries_data() {
        let req = AlgorithmRequest::new(Value::Null);
        let err = AlgoError::runtime("boom").into_detail(false);
        let resp = AlgorithmResponse::failure(&req, err, ResponseMeta::default());
        assert!(resp.is_error());
        assert_eq!(resp.code, 500);
        assert!(resp.data.is_none());
    }

    #[test]
    fn response_meta_override_takes_precedence_on_success() {
        let req = AlgorithmRequest::new(Value::Null);
        let meta = ResponseMeta {
            code: Some(201),
            message: Some("created".into()),
            context: None,
        };
        let resp = AlgorithmResponse::success(&req, serde_json::json!({"id": 1}), meta);
        assert_eq!(resp.code, 201);
        assert_eq!(resp.message, "created");
    }

    #[test]
    fn response_meta_override_takes_precedence_on_failure() {
        let req = AlgorithmRequest::new(Value::Null);
        let err = AlgoError::runtime("boom").into_detail(false);
        let meta = ResponseMeta {
            code: Some(418),
            message: Some("teapot".into()),
            context: None,
        };
        let resp = AlgorithmResponse::failure(&req, err, meta);
        assert_eq!(resp.code, 418);
        assert_eq!(resp.message, "teapot");
        assert!(resp.data.is_none());
    }
}
