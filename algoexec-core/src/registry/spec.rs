//! Typed algorithm catalog entry.
//!
//! An [`AlgorithmSpec`] is the immutable-once-registered description of one
//! `(name, version)` algorithm: its schemas, its entrypoint, and the
//! execution/observability hints that [`crate::executor::Executor`] and
//! [`crate::observe`] act on.

use std::collections::HashMap;
use std::sync::Arc;

use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::AlgoError;

/// Closed set of algorithm categories (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmKind {
    Prediction,
    Prepare,
    Programme,
}

/// Where a dispatched task is actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    InProcess,
    ProcessPool,
}

/// Execution hints from `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    pub mode: ExecutionMode,
    pub stateful: bool,
    pub isolated_pool: bool,
    pub max_workers: Option<usize>,
    pub timeout_s: Option<u64>,
    pub gpu: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::ProcessPool,
            stateful: false,
            isolated_pool: false,
            max_workers: None,
            timeout_s: None,
            gpu: None,
        }
    }
}

/// Observability hints from `spec.md` §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_input: bool,
    pub log_output: bool,
    pub on_error_only: bool,
    pub sample_rate: f64,
    pub max_payload_length: usize,
    pub redact_fields: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_input: false,
            log_output: false,
            on_error_only: false,
            sample_rate: 1.0,
            max_payload_length: 2048,
            redact_fields: Vec::new(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(format!(
                "sample_rate must be within [0, 1], got {}",
                self.sample_rate
            ));
        }
        Ok(())
    }
}

/// Non-functional catalog metadata (`spec.md` §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AlgorithmMetadata {
    pub description: Option<String>,
    pub created_time: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub application_scenarios: Option<String>,
    pub extra: HashMap<String, String>,
}

/// A lifecycle-driven, class-based algorithm implementation.
///
/// Implementors are instantiated fresh per task unless `stateful`, in which
/// case a single instance is cached per `(name, version)` inside whichever
/// runner/worker handles it (`spec.md` §4.4, §4.5).
pub trait AlgorithmLifecycle: Send + 'static {
    type Input: DeserializeOwned + JsonSchema + 'static;
    type Output: Serialize + JsonSchema + 'static;

    fn initialize(&mut self) -> Result<(), AlgoError> {
        Ok(())
    }

    fn run(&mut self, input: Self::Input) -> Result<Self::Output, AlgoError>;

    fn after_run(&mut self) -> Result<(), AlgoError> {
        Ok(())
    }

    /// Best-effort teardown. Errors here are logged, never propagated -
    /// see `spec.md` §4.4 ("a shutdown exception is logged, never
    /// propagated").
    fn shutdown(&mut self) {}
}

/// Type-erased lifecycle object, as stored inside a runner's instance cache.
///
/// Input/output coercion happens once, at the erasure boundary, via
/// `serde_json` round-tripping - this is the same coercion the envelope
/// layer performs (`spec.md` §4.2), just pushed down to the entrypoint seam
/// so the registry can hold heterogeneous specs in one map.
pub(crate) trait ErasedLifecycle: Send {
    fn initialize(&mut self) -> Result<(), AlgoError>;
    fn run(&mut self, input: Value) -> Result<Value, AlgoError>;
    fn after_run(&mut self) -> Result<(), AlgoError>;
    fn shutdown(&mut self);
}

struct LifecycleAdapter<T: AlgorithmLifecycle>(T);

impl<T: AlgorithmLifecycle> ErasedLifecycle for LifecycleAdapter<T> {
    fn initialize(&mut self) -> Result<(), AlgoError> {
        self.0.initialize()
    }

    fn run(&mut self, input: Value) -> Result<Value, AlgoError> {
        let typed: T::Input = serde_json::from_value(input).map_err(AlgoError::validation)?;
        let out = self.0.run(typed)?;
        serde_json::to_value(out).map_err(AlgoError::validation)
    }

    fn after_run(&mut self) -> Result<(), AlgoError> {
        self.0.after_run()
    }

    fn shutdown(&mut self) {
        self.0.shutdown()
    }
}

/// An algorithm's entrypoint, reconstructible by stable `(module, symbol)`
/// identity rather than by capturing request state.
///
/// The constructors below only accept plain function-pointer types
/// (`fn(...) -> ...`), not arbitrary closures, so nothing can close over
/// ambient request data - satisfying `spec.md` §3's "no closures over
/// request state" invariant at the type-system level instead of via a
/// runtime reflection check.
#[derive(Clone)]
pub enum Entrypoint {
    Function {
        module: &'static str,
        symbol: &'static str,
        input_schema: Arc<RootSchema>,
        output_schema: Arc<RootSchema>,
        call: Arc<dyn Fn(Value) -> Result<Value, AlgoError> + Send + Sync>,
    },
    Class {
        module: &'static str,
        symbol: &'static str,
        input_schema: Arc<RootSchema>,
        output_schema: Arc<RootSchema>,
        factory: Arc<dyn Fn() -> Box<dyn ErasedLifecycle> + Send + Sync>,
    },
}

impl Entrypoint {
    pub fn function<In, Out>(
        module: &'static str,
        symbol: &'static str,
        f: fn(In) -> Result<Out, AlgoError>,
    ) -> Self
    where
        In: DeserializeOwned + JsonSchema + 'static,
        Out: Serialize + JsonSchema + 'static,
    {
        let call = Arc::new(move |input: Value| -> Result<Value, AlgoError> {
            let typed: In = serde_json::from_value(input).map_err(AlgoError::validation)?;
            let out = f(typed)?;
            serde_json::to_value(out).map_err(AlgoError::validation)
        });
        Entrypoint::Function {
            module,
            symbol,
            input_schema: Arc::new(schemars::schema_for!(In)),
            output_schema: Arc::new(schemars::schema_for!(Out)),
            call,
        }
    }

    pub fn class<T>(module: &'static str, symbol: &'static str, factory: fn() -> T) -> Self
    where
        T: AlgorithmLifecycle,
    {
        let factory = Arc::new(move || -> Box<dyn ErasedLifecycle> {
            Box::new(LifecycleAdapter(factory()))
        });
        Entrypoint::Class {
            module,
            symbol,
            input_schema: Arc::new(schemars::schema_for!(T::Input)),
            output_schema: Arc::new(schemars::schema_for!(T::Output)),
            factory,
        }
    }

    pub fn module(&self) -> &'static str {
        match self {
            Entrypoint::Function { module, .. } => module,
            Entrypoint::Class { module, .. } => module,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Entrypoint::Function { symbol, .. } => symbol,
            Entrypoint::Class { symbol, .. } => symbol,
        }
    }

    pub fn input_schema(&self) -> &RootSchema {
        match self {
            Entrypoint::Function { input_schema, .. } => input_schema,
            Entrypoint::Class { input_schema, .. } => input_schema,
        }
    }

    pub fn output_schema(&self) -> &RootSchema {
        match self {
            Entrypoint::Function { output_schema, .. } => output_schema,
            Entrypoint::Class { output_schema, .. } => output_schema,
        }
    }

    pub fn is_class(&self) -> bool {
        matches!(self, Entrypoint::Class { .. })
    }

    pub(crate) fn call_function(&self, input: Value) -> Result<Value, AlgoError> {
        match self {
            Entrypoint::Function { call, .. } => call(input),
            Entrypoint::Class { .. } => {
                unreachable!("call_function invoked on a class entrypoint")
            }
        }
    }

    pub(crate) fn new_instance(&self) -> Box<dyn ErasedLifecycle> {
        match self {
            Entrypoint::Class { factory, .. } => factory(),
            Entrypoint::Function { .. } => {
                unreachable!("new_instance invoked on a function entrypoint")
            }
        }
    }
}

/// The full registered description of one algorithm.
#[derive(Clone)]
pub struct AlgorithmSpec {
    pub name: String,
    pub version: String,
    pub kind: AlgorithmKind,
    pub entrypoint: Entrypoint,
    pub execution: ExecutionConfig,
    pub logging: LoggingConfig,
    pub metadata: AlgorithmMetadata,
}

impl AlgorithmSpec {
    pub fn key(&self) -> (String, String) {
        (self.name.clone(), self.version.clone())
    }

    /// Effective timeout combining a request-level override with the
    /// spec's own hint, per `spec.md` §3's min rule: `min(request,spec)`
    /// when both are set, else whichever is set. `None` on both sides
    /// means unbounded; `0` is never treated as "unbounded".
    pub fn effective_timeout_s(&self, request_timeout_s: Option<u64>) -> Option<u64> {
        match (request_timeout_s, self.execution.timeout_s) {
            (Some(r), Some(s)) => Some(r.min(s)),
            (Some(r), None) => Some(r),
            (None, Some(s)) => Some(s),
            (None, None) => None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name must be non-empty".into());
        }
        if self.version.trim().is_empty() {
            return Err("version must be non-empty".into());
        }
        if self.entrypoint.module().trim().is_empty() || self.entrypoint.symbol().trim().is_empty()
        {
            return Err(
                "entrypoint must carry a non-empty (module, symbol) stable identity".into(),
            );
        }
        self.logging
            .validate()
            .map_err(|e| format!("invalid logging config: {e}"))?;
        if let Some(max_workers) = self.execution.max_workers {
            if max_workers == 0 {
                return Err("max_workers must be positive when set".into());
            }
        }
        Ok(())
    }
}
