//! True-subprocess integration tests for the supervised worker pool: hard
//! timeout kill+replace (S2), queue-full rejection (S3), and crash+respawn
//! (S4).
//!
//! This binary doubles as the worker process `ALGOEXEC_WORKER_EXE` points
//! at: re-exec'd with `--worker`, it runs `worker_main::run` against the
//! same `Double`/`Sleep`/`Crash` registry the tests below dispatch
//! against. `[[test]] harness = false` (see `Cargo.toml`) gives this file
//! a plain `fn main` instead of the default libtest harness - without
//! that, there would be no `main` here for `WorkerHandle::spawn` to
//! re-exec into.

use std::sync::Arc;
use std::time::Duration;

use algoexec_core::envelope::{AlgoError, ErrorKind};
use algoexec_core::observe::AlgorithmMetrics;
use algoexec_core::pool::{WorkerPool, WorkerPoolConfig};
use algoexec_core::registry::spec::{
    AlgorithmKind, AlgorithmMetadata, Entrypoint, ExecutionConfig, ExecutionMode, LoggingConfig,
};
use algoexec_core::registry::{AlgorithmRegistry, AlgorithmSpec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, JsonSchema)]
struct Num {
    value: i64,
}

fn double(input: Num) -> Result<Num, AlgoError> {
    Ok(Num {
        value: input.value * 2,
    })
}

fn sleep_two_seconds(input: Num) -> Result<Num, AlgoError> {
    std::thread::sleep(Duration::from_secs(2));
    Ok(input)
}

fn crash(_input: Num) -> Result<Num, AlgoError> {
    std::process::exit(70);
}

fn process_pool_spec(name: &'static str, f: fn(Num) -> Result<Num, AlgoError>) -> AlgorithmSpec {
    AlgorithmSpec {
        name: name.into(),
        version: "v1".into(),
        kind: AlgorithmKind::Prediction,
        entrypoint: Entrypoint::function("worker_pool_test", name, f),
        execution: ExecutionConfig {
            mode: ExecutionMode::ProcessPool,
            ..ExecutionConfig::default()
        },
        logging: LoggingConfig::default(),
        metadata: AlgorithmMetadata::default(),
    }
}

fn build_registry() -> AlgorithmRegistry {
    let registry = AlgorithmRegistry::new();
    registry
        .register_all(vec![
            process_pool_spec("Double", double),
            process_pool_spec("Sleep", sleep_two_seconds),
            process_pool_spec("Crash", crash),
        ])
        .unwrap();
    registry
}

fn is_worker_process() -> bool {
    std::env::args().any(|a| a == "--worker")
}

fn run_as_worker() {
    let registry = build_registry();
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime for worker process");
    runtime.block_on(async move {
        algoexec_core::worker_main::run(registry)
            .await
            .expect("worker request/response loop");
    });
}

fn test_pool(max_workers: usize) -> WorkerPool {
    std::env::set_var(
        "ALGOEXEC_WORKER_EXE",
        std::env::current_exe().expect("current_exe"),
    );
    WorkerPool::new(
        WorkerPoolConfig {
            max_workers,
            // S3 expects a pool at `max_workers=1` to reject a second
            // concurrent dispatch immediately; keeping the admission
            // queue equal to the worker count preserves that.
            queue_size: max_workers,
            kill_grace: Duration::from_millis(300),
            kill_tree: true,
        },
        Arc::new(AlgorithmMetrics::new()),
    )
}

/// S2 - a worker that misses its deadline is hard-killed, never returned
/// to the idle list, and the next dispatch gets a distinct replacement.
fn hard_timeout_kills_and_replaces_worker(rt: &tokio::runtime::Runtime) {
    rt.block_on(async {
        let pool = test_pool(1);
        let err = pool
            .dispatch(
                "Sleep",
                "v1",
                serde_json::json!({"value": 1}),
                None,
                Some(Duration::from_millis(100)),
                "req-s2a",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        let killed_worker_id = pool.last_worker_id();

        let result = pool
            .dispatch(
                "Double",
                "v1",
                serde_json::json!({"value": 21}),
                None,
                None,
                "req-s2b",
                None,
            )
            .await
            .expect("double succeeds once the sleeping worker is replaced");
        assert_eq!(result, serde_json::json!({"value": 42}));
        assert_ne!(pool.last_worker_id(), killed_worker_id);
    });
}

/// S3 - a pool at capacity rejects a second concurrent dispatch
/// immediately rather than queuing it.
fn queue_full_rejects_second_concurrent_dispatch(rt: &tokio::runtime::Runtime) {
    rt.block_on(async {
        let pool = Arc::new(test_pool(1));

        let holder = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ = pool
                    .dispatch(
                        "Sleep",
                        "v1",
                        serde_json::json!({"value": 1}),
                        None,
                        Some(Duration::from_secs(5)),
                        "req-s3a",
                        None,
                    )
                    .await;
            })
        };

        // Give the first dispatch time to acquire the pool's only permit
        // before the second one is sent.
        tokio::time::sleep(Duration::from_millis(150)).await;

        let err = pool
            .dispatch(
                "Sleep",
                "v1",
                serde_json::json!({"value": 1}),
                None,
                None,
                "req-s3b",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Rejected);

        // Don't wait out the first dispatch's 2s sleep; its worker is
        // killed on drop (`kill_on_drop`).
        holder.abort();
    });
}

/// S4 - a worker that exits the process surfaces as a system error, and
/// the pool respawns transparently for the next dispatch.
fn worker_crash_surfaces_system_error_then_respawns(rt: &tokio::runtime::Runtime) {
    rt.block_on(async {
        let pool = test_pool(1);
        let err = pool
            .dispatch(
                "Crash",
                "v1",
                serde_json::json!({"value": 1}),
                None,
                None,
                "req-s4a",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::System);

        let result = pool
            .dispatch(
                "Double",
                "v1",
                serde_json::json!({"value": 10}),
                None,
                None,
                "req-s4b",
                None,
            )
            .await
            .expect("double succeeds once the crashed worker is replaced");
        assert_eq!(result, serde_json::json!({"value": 20}));
    });
}

fn main() {
    if is_worker_process() {
        run_as_worker();
        return;
    }

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let tests: Vec<(&str, fn(&tokio::runtime::Runtime))> = vec![
        (
            "hard_timeout_kills_and_replaces_worker",
            hard_timeout_kills_and_replaces_worker,
        ),
        (
            "queue_full_rejects_second_concurrent_dispatch",
            queue_full_rejects_second_concurrent_dispatch,
        ),
        (
            "worker_crash_surfaces_system_error_then_respawns",
            worker_crash_surfaces_system_error_then_respawns,
        ),
    ];

    let mut failed = Vec::new();
    for (name, test) in tests {
        print!("test {name} ... ");
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| test(&rt))) {
            Ok(()) => println!("ok"),
            Err(_) => {
                println!("FAILED");
                failed.push(name);
            }
        }
    }

    if !failed.is_empty() {
        eprintln!("failures: {failed:?}");
        std::process::exit(1);
    }
}
