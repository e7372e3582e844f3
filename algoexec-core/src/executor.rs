//! Dispatching executor (C6).
//!
//! Routes a request to the right invocation path based on the target
//! spec's execution hint: synchronous in-process invocation, a shared
//! worker pool, or a pool isolated to just this algorithm
//! (`spec.md` §4.6). This is the seam where the envelope-level
//! [`crate::envelope::AlgorithmRequest`]/[`crate::envelope::AlgorithmResponse`]
//! meet the lower-level [`crate::runner::InProcessRunner`] and
//! [`crate::pool::WorkerPool`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::Instrument;

use crate::context::ExecutionContext;
use crate::envelope::{AlgoError, AlgorithmRequest, AlgorithmResponse, ErrorKind};
use crate::observe::{tracing_recorder, Recorder};
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::registry::spec::ExecutionMode;
use crate::registry::{AlgorithmRegistry, AlgorithmSpec};
use crate::runner::InProcessRunner;

type SpecKey = (String, String);

pub struct Executor {
    registry: AlgorithmRegistry,
    recorder: Recorder,
    in_process_runner: Arc<InProcessRunner>,
    shared_pool: Arc<WorkerPool>,
    isolated_pools: Mutex<HashMap<SpecKey, Arc<WorkerPool>>>,
    default_pool_config: WorkerPoolConfig,
}

impl Executor {
    pub fn new(registry: AlgorithmRegistry, recorder: Recorder, default_pool_config: WorkerPoolConfig) -> Self {
        let shared_pool = Arc::new(WorkerPool::new(default_pool_config.clone(), recorder.metrics()));
        Self {
            registry,
            recorder,
            in_process_runner: Arc::new(InProcessRunner::new()),
            shared_pool,
            isolated_pools: Mutex::new(HashMap::new()),
            default_pool_config,
        }
    }

    pub fn registry(&self) -> &AlgorithmRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Dispatches one already-coerced request to `spec`, producing a full
    /// response envelope. Never propagates an `Err` for an algorithm-level
    /// failure - those become `AlgorithmResponse`s with a non-zero `code`.
    pub async fn dispatch(&self, spec: &AlgorithmSpec, request: AlgorithmRequest) -> AlgorithmResponse {
        let ctx = ExecutionContext::with_hyperparams(
            request.request_id.clone(),
            request.context.trace_id.clone(),
            request.hyperparams.clone(),
        );
        let observation = self.recorder.start(
            &request.request_id,
            request.context.trace_id.as_deref(),
            &spec.name,
            &spec.version,
        );

        let timeout_s = spec.effective_timeout_s(request.timeout_s);
        let timeout = timeout_s.map(Duration::from_secs);
        let hyperparams = request.hyperparams.clone();
        let data = request.data.clone();

        let request_id = request.request_id.clone();
        let trace_id = request.context.trace_id.clone();
        let span = observation.span();
        let result = ctx
            .clone()
            .scope(self.run(spec, data, hyperparams, timeout, request_id, trace_id, ctx.clone()))
            .instrument(span)
            .await;

        match result {
            Ok(value) => {
                self.recorder.complete(observation);
                tracing_recorder::log_payloads(
                    &spec.logging,
                    &request.request_id,
                    &spec.name,
                    &spec.version,
                    false,
                    &request.data,
                    Some(&value),
                );
                AlgorithmResponse::success(&request, value, ctx.snapshot_meta())
            }
            Err(err) => {
                let kind = err.kind;
                self.recorder.fail(observation, kind);
                tracing_recorder::log_payloads(
                    &spec.logging,
                    &request.request_id,
                    &spec.name,
                    &spec.version,
                    true,
                    &request.data,
                    None,
                );
                let include_traceback = matches!(kind, ErrorKind::Runtime | ErrorKind::System);
                AlgorithmResponse::failure(&request, err.into_detail(include_traceback), ctx.snapshot_meta())
            }
        }
    }

    async fn run(
        &self,
        spec: &AlgorithmSpec,
        data: serde_json::Value,
        hyperparams: Option<serde_json::Value>,
        timeout: Option<Duration>,
        request_id: String,
        trace_id: Option<String>,
        ctx: ExecutionContext,
    ) -> Result<serde_json::Value, AlgoError> {
        match spec.execution.mode {
            ExecutionMode::InProcess => self.run_in_process(spec, data, timeout, ctx).await,
            ExecutionMode::ProcessPool => {
                let pool = self.pool_for(spec).await;
                pool.dispatch(
                    &spec.name,
                    &spec.version,
                    data,
                    hyperparams,
                    timeout,
                    &request_id,
                    trace_id.as_deref(),
                )
                .await
            }
        }
    }

    async fn run_in_process(
        &self,
        spec: &AlgorithmSpec,
        data: serde_json::Value,
        timeout: Option<Duration>,
        ctx: ExecutionContext,
    ) -> Result<serde_json::Value, AlgoError> {
        let runner = self.in_process_runner.clone();
        let spec = spec.clone();
        // `spawn_blocking`'s closure runs on a dedicated blocking thread,
        // outside the async task tree the outer `ExecutionContext::scope`
        // covers - `sync_scope` re-establishes the ambient there so the
        // algorithm can still reach `ExecutionContext::current()`.
        let task = tokio::task::spawn_blocking(move || ctx.sync_scope(|| runner.invoke(&spec, data)));

        let invoked = match timeout {
            Some(duration) => match tokio::time::timeout(duration, task).await {
                Ok(joined) => joined,
                Err(_) => {
                    // The blocking task keeps running to completion on its
                    // worker thread - in-process algorithms cannot be
                    // hard-killed the way worker processes can
                    // (`spec.md` §4.4). We simply stop waiting on it.
                    return Err(AlgoError::timeout(
                        "in-process algorithm did not complete within the effective timeout",
                    ));
                }
            },
            None => task.await,
        };

        invoked.unwrap_or_else(|join_err| Err(AlgoError::system(format!("algorithm thread panicked: {join_err}"))))
    }

    async fn pool_for(&self, spec: &AlgorithmSpec) -> Arc<WorkerPool> {
        if !spec.execution.isolated_pool {
            return self.shared_pool.clone();
        }
        let key = spec.key();
        let mut pools = self.isolated_pools.lock().await;
        pools
            .entry(key)
            .or_insert_with(|| {
                let mut config = self.default_pool_config.clone();
                if let Some(max_workers) = spec.execution.max_workers {
                    config.max_workers = max_workers;
                }
                Arc::new(WorkerPool::new(config, self.recorder.metrics()))
            })
            .clone()
    }

    /// Best-effort shutdown of the in-process runner's cached instances.
    /// Worker-pool processes are torn down by `Drop` via `kill_on_drop`.
    pub fn shutdown(&self) {
        self.in_process_runner.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::AlgorithmRequest;
    use crate::registry::spec::{
        AlgorithmKind, AlgorithmMetadata, Entrypoint, ExecutionConfig, LoggingConfig,
    };
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, JsonSchema)]
    struct In {
        value: i64,
    }
    #[derive(Debug, Serialize, JsonSchema)]
    struct Out {
        value: i64,
    }
    fn double(input: In) -> Result<Out, AlgoError> {
        Ok(Out {
            value: input.value * 2,
        })
    }
    fn failing(_input: In) -> Result<Out, AlgoError> {
        Err(AlgoError::runtime("always fails"))
    }

    fn make_executor() -> Executor {
        Executor::new(
            AlgorithmRegistry::new(),
            Recorder::new(),
            WorkerPoolConfig {
                max_workers: 2,
                queue_size: 4,
                kill_grace: Duration::from_millis(100),
                kill_tree: true,
            },
        )
    }

    fn in_process_spec(name: &str, entry: Entrypoint) -> AlgorithmSpec {
        AlgorithmSpec {
            name: name.into(),
            version: "v1".into(),
            kind: AlgorithmKind::Prediction,
            entrypoint: entry,
            execution: ExecutionConfig {
                mode: ExecutionMode::InProcess,
                ..ExecutionConfig::default()
            },
            logging: LoggingConfig::default(),
            metadata: AlgorithmMetadata::default(),
        }
    }

    #[tokio::test]
    async fn successful_in_process_dispatch_returns_result_and_no_error() {
        let executor = make_executor();
        let spec = in_process_spec("Double", Entrypoint::function(module_path!(), "double", double));
        let request = AlgorithmRequest::new(serde_json::json!({"value": 21}));
        let response = executor.dispatch(&spec, request).await;
        assert!(!response.is_error());
        assert_eq!(response.code, 0);
        assert_eq!(response.data, Some(serde_json::json!({"value": 42})));
    }

    #[tokio::test]
    async fn failing_in_process_dispatch_returns_runtime_error_detail() {
        let executor = make_executor();
        let spec = in_process_spec("Failing", Entrypoint::function(module_path!(), "failing", failing));
        let request = AlgorithmRequest::new(serde_json::json!({"value": 1}));
        let response = executor.dispatch(&spec, request).await;
        assert!(response.is_error());
        assert_eq!(response.code, ErrorKind::Runtime.http_status() as i32);
        assert!(response.data.is_none());
    }

    #[tokio::test]
    async fn malformed_input_surfaces_as_validation_error() {
        let executor = make_executor();
        let spec = in_process_spec("Double", Entrypoint::function(module_path!(), "double", double));
        let request = AlgorithmRequest::new(serde_json::json!({"value": "not-a-number"}));
        let response = executor.dispatch(&spec, request).await;
        assert!(response.is_error());
        assert_eq!(response.code, ErrorKind::Validation.http_status() as i32);
    }
}
