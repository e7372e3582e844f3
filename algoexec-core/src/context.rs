//! Per-request ambient execution context (C3).
//!
//! Rather than threading a context argument through every call, the active
//! request's identity and the three response-meta override slots
//! (`spec.md` §4.3) live in a task-local, scoped for the lifetime of one
//! dispatch via [`ExecutionContext::scope`]. This is the same
//! "ambient, not parameter" shape as the teacher's tracing spans, just
//! carrying structured state instead of log fields.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::envelope::ResponseMeta;

tokio::task_local! {
    static CURRENT: Arc<ExecutionContextInner>;
}

struct ExecutionContextInner {
    request_id: String,
    trace_id: Option<String>,
    hyperparams: Option<Value>,
    meta: Mutex<ResponseMeta>,
}

/// Handle to the ambient context of the request currently being dispatched.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<ExecutionContextInner>,
}

impl ExecutionContext {
    pub fn new(request_id: String, trace_id: Option<String>) -> Self {
        Self::with_hyperparams(request_id, trace_id, None)
    }

    /// Like [`ExecutionContext::new`], additionally carrying a spec's
    /// optional hyperparameters payload (`spec.md` §3: a class entrypoint's
    /// `run` may accept "an input model (plus optional hyperparameters
    /// model)"). Exposed through the same ambient as `response_meta`
    /// rather than as a second `run` parameter, so function entrypoints -
    /// which take exactly one argument - can read it too when they need to.
    pub fn with_hyperparams(request_id: String, trace_id: Option<String>, hyperparams: Option<Value>) -> Self {
        Self {
            inner: Arc::new(ExecutionContextInner {
                request_id,
                trace_id,
                hyperparams,
                meta: Mutex::new(ResponseMeta::default()),
            }),
        }
    }

    /// Runs `fut` with `self` installed as the ambient context for its
    /// entire `.await` chain, including across task-local-unaware library
    /// boundaries (axum handlers, spawned subtasks that re-enter
    /// `current`). Torn down when `fut` resolves, including on panic -
    /// `tokio::task_local`'s scope is itself a `Drop`-backed guard.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self.inner, fut).await
    }

    /// Synchronous counterpart to [`ExecutionContext::scope`], for code
    /// that runs a blocking closure off the async task tree entirely -
    /// `tokio::task::spawn_blocking` does not inherit an outer `.scope()`'s
    /// task-local, since the closure runs on a dedicated blocking thread
    /// rather than being polled as part of the scoped future. The
    /// in-process runner re-establishes the ambient this way from inside
    /// its `spawn_blocking` closure so an algorithm's synchronous `run` can
    /// still call `ExecutionContext::current()` (`spec.md` §4.3, scenario
    /// S6 for `in_process`-hinted algorithms).
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(self.inner, f)
    }

    /// Fetches the ambient context, panicking if called outside a
    /// [`ExecutionContext::scope`]. Every dispatch path installs one before
    /// invoking an entrypoint, so this is an invariant violation, not a
    /// recoverable condition.
    pub fn current() -> Self {
        Self {
            inner: CURRENT.with(Arc::clone),
        }
    }

    pub fn try_current() -> Option<Self> {
        CURRENT.try_with(Arc::clone).ok().map(|inner| Self { inner })
    }

    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.inner.trace_id.as_deref()
    }

    /// The request's hyperparameters payload, if any (`spec.md` §3).
    pub fn hyperparams(&self) -> Option<&Value> {
        self.inner.hyperparams.as_ref()
    }

    /// Overrides the response `code` that will be used instead of the
    /// engine's success/error default (`spec.md` §4.3, scenario S6).
    pub fn set_response_code(&self, code: i32) {
        self.inner.meta.lock().unwrap().code = Some(code);
    }

    /// Overrides the response `message`.
    pub fn set_response_message(&self, message: impl Into<String>) {
        self.inner.meta.lock().unwrap().message = Some(message.into());
    }

    /// Overrides the response `context`.
    pub fn set_response_context(&self, context: Value) {
        self.inner.meta.lock().unwrap().context = Some(context);
    }

    pub fn snapshot_meta(&self) -> ResponseMeta {
        self.inner.meta.lock().unwrap().clone()
    }

    /// Merges a [`ResponseMeta`] snapshot taken inside a worker process
    /// back onto this (parent-side) ambient context, so a process-pool
    /// dispatch observes the same overrides an in-process dispatch would
    /// (`spec.md` §4.3/§9: the cross-process ambient is recreated inside
    /// the worker and the final snapshot is carried back alongside the
    /// result). `None` slots in `remote` leave the parent's own slots -
    /// normally untouched anyway, since nothing runs on the parent side
    /// of a process-pool dispatch - as they are.
    pub fn merge_remote_meta(&self, remote: ResponseMeta) {
        let mut meta = self.inner.meta.lock().unwrap();
        if remote.code.is_some() {
            meta.code = remote.code;
        }
        if remote.message.is_some() {
            meta.message = remote.message;
        }
        if remote.context.is_some() {
            meta.context = remote.context;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scope_exposes_current_context() {
        let ctx = ExecutionContext::new("req-1".into(), Some("trace-1".into()));
        ctx.clone()
            .scope(async {
                let current = ExecutionContext::current();
                assert_eq!(current.request_id(), "req-1");
                assert_eq!(current.trace_id(), Some("trace-1"));
            })
            .await;
    }

    #[tokio::test]
    async fn meta_mutations_are_visible_after_scope_via_handle() {
        let ctx = ExecutionContext::new("req-2".into(), None);
        let ctx2 = ctx.clone();
        ctx2.scope(async {
            ExecutionContext::current().set_response_code(201);
            ExecutionContext::current().set_response_message("created");
        })
        .await;
        let meta = ctx.snapshot_meta();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("created"));
    }

    #[test]
    fn try_current_is_none_outside_scope() {
        assert!(ExecutionContext::try_current().is_none());
    }

    #[tokio::test]
    async fn hyperparams_are_readable_through_the_ambient() {
        let ctx = ExecutionContext::with_hyperparams("req-5".into(), None, Some(serde_json::json!({"k": 1})));
        ctx.scope(async {
            assert_eq!(
                ExecutionContext::current().hyperparams(),
                Some(&serde_json::json!({"k": 1}))
            );
        })
        .await;
    }

    #[test]
    fn hyperparams_default_to_none() {
        let ctx = ExecutionContext::new("req-6".into(), None);
        assert!(ctx.hyperparams().is_none());
    }

    #[tokio::test]
    async fn sync_scope_exposes_current_context_to_a_blocking_closure() {
        let ctx = ExecutionContext::new("req-4".into(), None);
        let ctx2 = ctx.clone();
        tokio::task::spawn_blocking(move || {
            ctx2.sync_scope(|| {
                ExecutionContext::current().set_response_code(202);
            })
        })
        .await
        .unwrap();
        assert_eq!(ctx.snapshot_meta().code, Some(202));
    }

    #[test]
    fn merge_remote_meta_only_overwrites_set_slots() {
        let ctx = ExecutionContext::new("req-3".into(), None);
        ctx.set_response_message("local default");
        ctx.merge_remote_meta(ResponseMeta {
            code: Some(201),
            message: None,
            context: None,
        });
        let meta = ctx.snapshot_meta();
        assert_eq!(meta.code, Some(201));
        assert_eq!(meta.message.as_deref(), Some("local default"));
    }
}
