//! Service registry publisher hook (C10).
//!
//! Grounded on the Python original's `consul_registry.py` and
//! `catalog.py`: on entering `Running`, register this instance and PUT its
//! algorithm catalog into the registry's KV store; on `Shutdown`,
//! deregister and delete the KV entry. Publish runs as a `before` hook on
//! the `Running` transition, so a registration failure blocks the
//! transition instead of leaving the service accepting traffic it never
//! advertised; retract runs as an `after` hook on `Shutdown` and is
//! best-effort - a registry outage there must never block teardown.

use serde::Serialize;
use serde_json::Value;

use crate::config::{RegistryConfig, ServiceIdentity};
use crate::error::RegistryClientError;
use crate::registry::AlgorithmRegistry;

#[derive(Serialize)]
struct CatalogAlgorithmEntry {
    name: String,
    version: String,
    kind: crate::registry::spec::AlgorithmKind,
    description: Option<String>,
    route: String,
    schema_url: String,
    absolute_route: String,
    absolute_schema_url: String,
    input_schema: Value,
    output_schema: Value,
}

#[derive(Serialize)]
struct Catalog {
    service: String,
    service_id: String,
    service_version: String,
    host: String,
    port: u16,
    base_url: String,
    list_url: String,
    algorithms: Vec<CatalogAlgorithmEntry>,
}

fn kv_key(identity: &ServiceIdentity) -> String {
    format!(
        "services/{}/{}/algorithms",
        identity.service_name, identity.instance_id
    )
}

fn build_catalog(identity: &ServiceIdentity, registry: &AlgorithmRegistry) -> Catalog {
    let base_url = format!("http://{}:{}", identity.host, identity.port);
    let algorithms = registry
        .list()
        .into_iter()
        .map(|spec| {
            let route = format!("/algorithms/{}/{}", spec.name, spec.version);
            let schema_url = format!("{route}/schema");
            CatalogAlgorithmEntry {
                absolute_route: format!("{base_url}{route}"),
                absolute_schema_url: format!("{base_url}{schema_url}"),
                input_schema: serde_json::to_value(spec.entrypoint.input_schema())
                    .unwrap_or(Value::Null),
                output_schema: serde_json::to_value(spec.entrypoint.output_schema())
                    .unwrap_or(Value::Null),
                description: spec.metadata.description.clone(),
                kind: spec.kind,
                name: spec.name,
                version: spec.version,
                route,
                schema_url,
            }
        })
        .collect();

    Catalog {
        service: identity.service_name.clone(),
        service_id: identity.instance_id.clone(),
        service_version: identity.service_version.clone(),
        host: identity.host.clone(),
        port: identity.port,
        base_url: base_url.clone(),
        list_url: format!("{base_url}/algorithms"),
        algorithms,
    }
}

/// Publishes/retracts this instance's algorithm catalog in an external,
/// Consul-KV-shaped service registry over plain HTTP.
pub struct RegistryPublisher {
    config: RegistryConfig,
    identity: ServiceIdentity,
    client: reqwest::Client,
}

impl RegistryPublisher {
    pub fn new(config: RegistryConfig, identity: ServiceIdentity) -> Self {
        Self {
            config,
            identity,
            client: reqwest::Client::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Registers this instance with the registry's health-check agent and
    /// publishes its catalog into KV. Called once the service reaches
    /// `Running`.
    pub async fn publish(&self, registry: &AlgorithmRegistry) -> Result<(), RegistryClientError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.register_instance().await?;
        self.publish_catalog(registry).await
    }

    /// Deregisters the instance and deletes its KV entry. Called on
    /// `Shutdown`. Swallows (logs) failures at the call site rather than
    /// here, since shutdown must proceed regardless.
    pub async fn retract(&self) -> Result<(), RegistryClientError> {
        if !self.config.enabled {
            return Ok(());
        }
        self.deregister_instance().await?;
        self.delete_catalog().await
    }

    async fn register_instance(&self) -> Result<(), RegistryClientError> {
        let url = format!("{}/v1/agent/service/register", self.config.registry_host);
        let body = serde_json::json!({
            "ID": self.identity.instance_id,
            "Name": self.identity.service_name,
            "Address": self.identity.host,
            "Port": self.identity.port,
            "Check": {
                "HTTP": format!("http://{}:{}/healthz", self.identity.host, self.identity.port),
                "Interval": format!("{}s", self.config.health_check_interval.as_secs()),
                "Timeout": format!("{}s", self.config.health_check_timeout.as_secs()),
            }
        });
        let response = self.client.put(&url).json(&body).send().await?;
        ensure_success(response).await
    }

    async fn deregister_instance(&self) -> Result<(), RegistryClientError> {
        let url = format!(
            "{}/v1/agent/service/deregister/{}",
            self.config.registry_host, self.identity.instance_id
        );
        let response = self.client.put(&url).send().await?;
        ensure_success(response).await
    }

    async fn publish_catalog(&self, registry: &AlgorithmRegistry) -> Result<(), RegistryClientError> {
        let catalog = build_catalog(&self.identity, registry);
        let url = format!(
            "{}/v1/kv/{}",
            self.config.registry_host,
            kv_key(&self.identity)
        );
        let response = self.client.put(&url).json(&catalog).send().await?;
        ensure_success(response).await
    }

    async fn delete_catalog(&self) -> Result<(), RegistryClientError> {
        let url = format!(
            "{}/v1/kv/{}",
            self.config.registry_host,
            kv_key(&self.identity)
        );
        let response = self.client.delete(&url).send().await?;
        ensure_success(response).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<(), RegistryClientError> {
    if response.status().is_success() {
        Ok(())
    } else {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(RegistryClientError::Status { status, body })
    }
}
