//! algoexec-core - algorithm execution service runtime.
//!
//! Typed registry of algorithms (C1), an envelope/error model shared by
//! every invocation path (C2), ambient per-request context (C3), two
//! invocation paths - synchronous in-process (C4) and a supervised
//! worker-process pool (C5) - dispatched by execution hint (C6),
//! observation recording (C7), a lifecycle state machine (C8), an HTTP
//! front door (C9), and a service registry publisher (C10).

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod http;
pub mod observe;
pub mod pool;
pub mod registry;
pub mod registry_publisher;
pub mod runner;
pub mod runtime;
pub mod worker_main;

pub use config::Config;
pub use envelope::{AlgoError, AlgorithmRequest, AlgorithmResponse, ErrorKind};
pub use executor::Executor;
pub use registry::{AlgorithmRegistry, AlgorithmSpec};
pub use runtime::{ServiceRuntime, ServiceState};

/// Installs the process-wide tracing subscriber. Call once, before
/// anything logs - both `main` and the re-exec'd `--worker` path call
/// this so worker logs share the parent's format.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
