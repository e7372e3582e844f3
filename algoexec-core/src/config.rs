//! Environment-driven service configuration.
//!
//! Mirrors the environment keys in the service's external interface
//! contract. Nothing here reads a config file - algorithm metadata
//! overrides (`*.algometa.yaml`) are a separate, registry-scoped concern
//! handled by [`crate::registry::overrides`].

use std::env;
use std::time::Duration;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Bind address and port for the HTTP listener.
#[derive(Debug, Clone)]
pub struct ServiceIdentity {
    pub host: String,
    pub port: u16,
    pub service_name: String,
    pub service_version: String,
    pub instance_id: String,
}

/// Service registry publisher settings (C10).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub enabled: bool,
    pub registry_host: String,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
}

/// Supervised worker pool sizing and kill semantics (C5).
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub global_max_workers: usize,
    pub global_queue_size: usize,
    pub kill_tree: bool,
    pub kill_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

/// Top-level configuration assembled once at startup from the process
/// environment. See `spec.md` / `SPEC_FULL.md` §6 for the recognized keys.
#[derive(Debug, Clone)]
pub struct Config {
    pub identity: ServiceIdentity,
    pub registry: RegistryConfig,
    pub executor: ExecutorConfig,
    pub admin: AdminConfig,
    pub cors: CorsConfig,
    /// Comma-separated module identities whose load triggers algorithm
    /// registration. Peripheral to this crate (decorator sugar lives
    /// elsewhere) but threaded through so a worker re-exec can reconstruct
    /// the same registry contents as its parent.
    pub algo_modules: Vec<String>,
    /// Directory of `*.algometa.yaml` override files, re-scanned by
    /// `POST /admin/overrides/reload` as well as at startup.
    pub overrides_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let max_workers = env_parsed("EXECUTOR_GLOBAL_MAX_WORKERS", default_max_workers());
        let queue_size = env_parsed("EXECUTOR_GLOBAL_QUEUE_SIZE", 2 * max_workers);

        Self {
            identity: ServiceIdentity {
                host: env_string("SERVICE_HOST", "0.0.0.0"),
                port: env_parsed("SERVICE_PORT", 8080),
                service_name: env_string("SERVICE_NAME", "algoexec"),
                service_version: env_string("SERVICE_VERSION", env!("CARGO_PKG_VERSION")),
                instance_id: env_string("SERVICE_INSTANCE_ID", &uuid::Uuid::new_v4().to_string()),
            },
            registry: RegistryConfig {
                enabled: env_bool("SERVICE_REGISTRY_ENABLED", false),
                registry_host: env_string("SERVICE_REGISTRY_HOST", "http://127.0.0.1:8500"),
                health_check_interval: Duration::from_secs(env_parsed(
                    "HEALTH_CHECK_INTERVAL",
                    10,
                )),
                health_check_timeout: Duration::from_secs(env_parsed("HEALTH_CHECK_TIMEOUT", 5)),
            },
            executor: ExecutorConfig {
                global_max_workers: max_workers,
                global_queue_size: queue_size,
                kill_tree: env_bool("EXECUTOR_KILL_TREE", true),
                kill_grace: Duration::from_secs(env_parsed("EXECUTOR_KILL_GRACE_S", 5)),
            },
            admin: AdminConfig {
                enabled: env_bool("SERVICE_ADMIN_ENABLED", false),
            },
            cors: CorsConfig {
                allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                    .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                    .unwrap_or_default(),
            },
            algo_modules: env::var("ALGO_MODULES")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            overrides_dir: env::var("ALGOMETA_OVERRIDES_DIR").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // Clear any host env vars the developer's shell might leak into the
        // test process so defaults are observed deterministically.
        for key in ["SERVICE_HOST", "SERVICE_PORT", "EXECUTOR_GLOBAL_MAX_WORKERS"] {
            env::remove_var(key);
        }
        let config = Config::from_env();
        assert_eq!(config.identity.host, "0.0.0.0");
        assert_eq!(config.identity.port, 8080);
        assert!(config.executor.global_max_workers >= 1);
        assert_eq!(
            config.executor.global_queue_size,
            2 * config.executor.global_max_workers
        );
    }

    #[test]
    fn explicit_queue_size_overrides_default() {
        env::set_var("EXECUTOR_GLOBAL_MAX_WORKERS", "3");
        env::set_var("EXECUTOR_GLOBAL_QUEUE_SIZE", "100");
        let config = Config::from_env();
        assert_eq!(config.executor.global_max_workers, 3);
        assert_eq!(config.executor.global_queue_size, 100);
        env::remove_var("EXECUTOR_GLOBAL_MAX_WORKERS");
        env::remove_var("EXECUTOR_GLOBAL_QUEUE_SIZE");
    }
}
