//! In-process runner (C4).
//!
//! Grounded on the teacher's `NativeExecutor` (`enviro-core/src/executor/mod.rs`)
//! for the invoker shape, and on the Python original's
//! `InProcessExecutor`/`AlgorithmLifecycle` for the actual semantics:
//! stateful instances are cached per `(name, version)`, stateless ones are
//! built fresh per call, and `shutdown` is best-effort and never propagates.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

use crate::envelope::AlgoError;
use crate::registry::spec::{Entrypoint, ErasedLifecycle};
use crate::registry::AlgorithmSpec;

type InstanceKey = (String, String);

/// Runs `run`, then `after_run` only if `run` succeeded (`spec.md` §4.4:
/// "if run raises, after_run is skipped"). An `after_run` failure replaces
/// a successful `run` result, since `after_run` is part of the same
/// lifecycle step and its own failure is the more recent, more relevant
/// one to surface.
fn run_then_after_run(instance: &mut dyn ErasedLifecycle, input: Value) -> Result<Value, AlgoError> {
    let result = instance.run(input)?;
    instance.after_run()?;
    Ok(result)
}

/// Synchronous, single-process invoker for algorithms whose execution hint
/// is `in_process`. Owns a cache of stateful class instances; stateless
/// calls - including every `Function` entrypoint - never touch the cache.
#[derive(Default)]
pub struct InProcessRunner {
    instances: Mutex<HashMap<InstanceKey, Box<dyn ErasedLifecycle>>>,
}

impl InProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs one request through `spec`'s entrypoint, following the
    /// lifecycle `initialize -> run -> after_run` for class entrypoints
    /// (`spec.md` §4.4). `initialize` only runs once per cached instance.
    pub fn invoke(&self, spec: &AlgorithmSpec, input: Value) -> Result<Value, AlgoError> {
        match &spec.entrypoint {
            Entrypoint::Function { .. } => spec.entrypoint.call_function(input),
            Entrypoint::Class { .. } => self.invoke_class(spec, input),
        }
    }

    fn invoke_class(&self, spec: &AlgorithmSpec, input: Value) -> Result<Value, AlgoError> {
        if spec.execution.stateful {
            let key = spec.key();
            let mut instances = self.instances.lock().unwrap();
            if !instances.contains_key(&key) {
                let mut instance = spec.entrypoint.new_instance();
                instance.initialize()?;
                instances.insert(key.clone(), instance);
            }
            let instance = instances.get_mut(&key).expect("just inserted");
            run_then_after_run(instance.as_mut(), input)
        } else {
            let mut instance = spec.entrypoint.new_instance();
            instance.initialize()?;
            let result = run_then_after_run(instance.as_mut(), input);
            tracing::debug!(algorithm = %spec.name, version = %spec.version, "shutting down stateless instance");
            instance.shutdown();
            result
        }
    }

    /// Tears down every cached stateful instance. Per-instance shutdown
    /// exceptions are swallowed - logged by the caller, never propagated -
    /// so one broken algorithm cannot block the others from shutting down.
    pub fn shutdown(&self) {
        let mut instances = self.instances.lock().unwrap();
        for ((name, version), mut instance) in instances.drain() {
            tracing::debug!(algorithm = %name, version = %version, "shutting down cached instance");
            instance.shutdown();
        }
    }

    pub fn cached_instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::spec::{
        AlgorithmKind, AlgorithmLifecycle, AlgorithmMetadata, ExecutionConfig, LoggingConfig,
    };
    use schemars::JsonSchema;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

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

    struct Counter {
        calls: Arc<AtomicUsize>,
        initialized: bool,
    }

    impl AlgorithmLifecycle for Counter {
        type Input = In;
        type Output = Out;

        fn initialize(&mut self) -> Result<(), AlgoError> {
            self.initialized = true;
            Ok(())
        }

        fn run(&mut self, input: Self::Input) -> Result<Self::Output, AlgoError> {
            assert!(self.initialized);
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Out {
                value: input.value + n as i64,
            })
        }
    }

    static COUNTER_CALLS: std::sync::OnceLock<Arc<AtomicUsize>> = std::sync::OnceLock::new();

    fn counter_calls() -> Arc<AtomicUsize> {
        COUNTER_CALLS
            .get_or_init(|| Arc::new(AtomicUsize::new(0)))
            .clone()
    }

    fn new_counter() -> Counter {
        Counter {
            calls: counter_calls(),
            initialized: false,
        }
    }

    fn function_spec() -> AlgorithmSpec {
        AlgorithmSpec {
            name: "Double".into(),
            version: "v1".into(),
            kind: AlgorithmKind::Prediction,
            entrypoint: Entrypoint::function(module_path!(), "double", double),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            metadata: AlgorithmMetadata::default(),
        }
    }

    fn stateful_class_spec() -> AlgorithmSpec {
        let mut execution = ExecutionConfig::default();
        execution.stateful = true;
        AlgorithmSpec {
            name: "Counter".into(),
            version: "v1".into(),
            kind: AlgorithmKind::Prediction,
            entrypoint: Entrypoint::class(module_path!(), "Counter", new_counter),
            execution,
            logging: LoggingConfig::default(),
            metadata: AlgorithmMetadata::default(),
        }
    }

    #[test]
    fn function_entrypoints_never_touch_the_instance_cache() {
        let runner = InProcessRunner::new();
        let spec = function_spec();
        let out = runner
            .invoke(&spec, serde_json::json!({"value": 4}))
            .unwrap();
        assert_eq!(out, serde_json::json!({"value": 8}));
        assert_eq!(runner.cached_instance_count(), 0);
    }

    #[test]
    fn stateful_class_entrypoints_reuse_one_cached_instance() {
        let runner = InProcessRunner::new();
        let spec = stateful_class_spec();
        runner.invoke(&spec, serde_json::json!({"value": 0})).unwrap();
        runner.invoke(&spec, serde_json::json!({"value": 0})).unwrap();
        assert_eq!(runner.cached_instance_count(), 1);
    }

    #[test]
    fn shutdown_clears_cached_instances() {
        let runner = InProcessRunner::new();
        let spec = stateful_class_spec();
        runner.invoke(&spec, serde_json::json!({"value": 0})).unwrap();
        assert_eq!(runner.cached_instance_count(), 1);
        runner.shutdown();
        assert_eq!(runner.cached_instance_count(), 0);
    }

    struct Flaky {
        after_run_calls: Arc<AtomicUsize>,
        shutdown_calls: Arc<AtomicUsize>,
    }

    impl AlgorithmLifecycle for Flaky {
        type Input = In;
        type Output = Out;

        fn run(&mut self, _input: Self::Input) -> Result<Self::Output, AlgoError> {
            Err(AlgoError::runtime("run always fails"))
        }

        fn after_run(&mut self) -> Result<(), AlgoError> {
            self.after_run_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    static FLAKY_AFTER_RUN_CALLS: std::sync::OnceLock<Arc<AtomicUsize>> = std::sync::OnceLock::new();
    static FLAKY_SHUTDOWN_CALLS: std::sync::OnceLock<Arc<AtomicUsize>> = std::sync::OnceLock::new();

    fn new_flaky() -> Flaky {
        Flaky {
            after_run_calls: FLAKY_AFTER_RUN_CALLS
                .get_or_init(|| Arc::new(AtomicUsize::new(0)))
                .clone(),
            shutdown_calls: FLAKY_SHUTDOWN_CALLS
                .get_or_init(|| Arc::new(AtomicUsize::new(0)))
                .clone(),
        }
    }

    #[test]
    fn failing_run_skips_after_run_but_still_shuts_down() {
        let spec = AlgorithmSpec {
            name: "Flaky".into(),
            version: "v1".into(),
            kind: AlgorithmKind::Prediction,
            entrypoint: Entrypoint::class(module_path!(), "Flaky", new_flaky),
            execution: ExecutionConfig::default(),
            logging: LoggingConfig::default(),
            metadata: AlgorithmMetadata::default(),
        };

        let runner = InProcessRunner::new();
        let err = runner
            .invoke(&spec, serde_json::json!({"value": 1}))
            .unwrap_err();
        assert_eq!(err.kind, crate::envelope::ErrorKind::Runtime);
        assert_eq!(
            FLAKY_AFTER_RUN_CALLS.get().unwrap().load(Ordering::SeqCst),
            0
        );
        assert_eq!(FLAKY_SHUTDOWN_CALLS.get().unwrap().load(Ordering::SeqCst), 1);
    }
}
