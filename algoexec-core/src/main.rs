//! `algoexecd` - algorithm execution service binary.
//!
//! Re-execs itself with `--worker` to become a supervised worker process
//! (see [`algoexec_core::pool::worker::WorkerHandle::spawn`]); otherwise
//! runs the HTTP front door.

use std::sync::Arc;

use algoexec_core::config::Config;
use algoexec_core::executor::Executor;
use algoexec_core::http::{self, AppState};
use algoexec_core::observe::Recorder;
use algoexec_core::pool::WorkerPoolConfig;
use algoexec_core::registry::AlgorithmRegistry;
use algoexec_core::registry_publisher::RegistryPublisher;
use algoexec_core::runtime::{ServiceRuntime, ServiceState};
use algoexec_core::worker_main;

/// Registers the algorithms this deployment ships with. Concrete
/// algorithm bodies are an embedding concern, not this crate's - this
/// function is the one seam both the parent process and every re-exec'd
/// worker call, so both ends of the process boundary agree on the
/// catalog without needing to serialize entrypoints across it.
fn build_registry() -> AlgorithmRegistry {
    let registry = AlgorithmRegistry::new();
    // No built-in algorithms ship with this binary; embed this crate as a
    // library and call `registry.register(...)` here (or fork this
    // function) to add your own.
    registry
}

fn is_worker_process() -> bool {
    std::env::args().any(|a| a == "--worker")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    algoexec_core::init_tracing();

    if is_worker_process() {
        let registry = build_registry();
        worker_main::run(registry).await?;
        return Ok(());
    }

    let config = Config::from_env();
    tracing::info!(
        service = %config.identity.service_name,
        instance = %config.identity.instance_id,
        host = %config.identity.host,
        port = config.identity.port,
        "starting algoexecd"
    );

    let registry = build_registry();
    if let Some(dir) = &config.overrides_dir {
        match registry.load_overrides(std::path::Path::new(dir)) {
            Ok(count) => tracing::info!(count, "applied algorithm metadata overrides"),
            Err(e) => tracing::error!(error = %e, "failed to load algorithm metadata overrides"),
        }
    }

    let recorder = Recorder::new();
    let pool_config = WorkerPoolConfig::from(&config.executor);
    let executor = Arc::new(Executor::new(registry, recorder, pool_config));

    let runtime = ServiceRuntime::new();
    let publisher = if config.registry.enabled {
        Some(Arc::new(RegistryPublisher::new(
            config.registry.clone(),
            config.identity.clone(),
        )))
    } else {
        None
    };

    if let Some(publisher) = publisher.clone() {
        let executor_for_hook = executor.clone();
        runtime.hooks().before(ServiceState::Running, 0, move |_, _| {
            let publisher = publisher.clone();
            let executor = executor_for_hook.clone();
            Box::pin(async move {
                publisher
                    .publish(executor.registry())
                    .await
                    .map_err(anyhow::Error::from)
            })
        });

        let publisher_for_shutdown = publisher.clone();
        runtime.hooks().after(ServiceState::Shutdown, 0, move |_, _| {
            let publisher = publisher_for_shutdown.clone();
            Box::pin(async move { publisher.retract().await.map_err(anyhow::Error::from) })
        });
    }

    let state = Arc::new(AppState {
        executor: executor.clone(),
        runtime: runtime.clone(),
        publisher,
        admin_enabled: config.admin.enabled,
        overrides_dir: config.overrides_dir.clone(),
    });

    runtime.provisioning().await?;
    runtime.ready().await?;
    runtime.running().await?;

    let app = http::router(state, &config.cors);
    let addr = format!("{}:{}", config.identity.host, config.identity.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let shutdown_runtime = runtime.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_runtime.draining().await;
        })
        .await?;

    executor.shutdown();
    runtime.shutdown().await?;
    Ok(())
}
