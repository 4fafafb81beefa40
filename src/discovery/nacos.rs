//! Nacos naming API client.
//!
//! Speaks the v1 open API over HTTP:
//! - `GET  /nacos/v1/ns/service` decides whether a service is known,
//! - `GET  /nacos/v1/ns/instance/list` lists its instances,
//! - `POST`/`DELETE /nacos/v1/ns/instance` registers and deregisters,
//! - `PUT  /nacos/v1/ns/instance/beat` keeps ephemeral instances alive.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::config::NacosConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HealthStatus, InstanceSet, ServiceInstance};
use crate::discovery::service_discovery::{ServiceRegistrar, ServiceResolver};

/// Nacos weights are floats; they are scaled to integers for the load balancer
const WEIGHT_SCALE: f64 = 100.0;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NacosHost {
    ip: String,
    port: u16,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default = "default_weight")]
    weight: f64,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl NacosHost {
    fn into_instance(self, service: &str) -> ServiceInstance {
        let health = if !self.enabled {
            HealthStatus::Disabled
        } else if !self.healthy {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        let weight = (self.weight.max(0.0) * WEIGHT_SCALE).round() as u32;

        let mut instance = ServiceInstance::new(service, self.ip, self.port)
            .with_weight(weight)
            .with_health(health);
        if let Some(id) = self.instance_id {
            instance.id = id;
        }
        instance.metadata = self.metadata;
        instance
    }
}

/// Resolver and registrar backed by a Nacos server
pub struct NacosRegistry {
    client: Client,
    base: String,
    config: NacosConfig,
}

impl NacosRegistry {
    pub fn new(config: NacosConfig) -> GatewayResult<Self> {
        Url::parse(&config.address).map_err(|e| {
            GatewayError::config(format!("Invalid Nacos address '{}': {}", config.address, e))
        })?;

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build Nacos client: {}", e)))?;

        Ok(Self {
            client,
            base: config.address.trim_end_matches('/').to_string(),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/nacos/v1/ns/{}", self.base, path)
    }

    fn unavailable(&self, service: &str, reason: impl Into<String>) -> GatewayError {
        GatewayError::ResolverUnavailable {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    /// Probe the server once; used at startup so an unreachable registry is reported early
    pub async fn ping(&self) -> GatewayResult<()> {
        let response = self
            .client
            .get(self.url("operator/metrics"))
            .send()
            .await
            .map_err(|e| self.unavailable("*", format!("registry unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.unavailable(
                "*",
                format!("registry health probe returned {}", response.status()),
            ));
        }
        Ok(())
    }

    async fn service_exists(&self, service: &str) -> GatewayResult<bool> {
        let response = self
            .client
            .get(self.url("service"))
            .query(&[
                ("serviceName", service),
                ("namespaceId", self.config.namespace.as_str()),
                ("groupName", self.config.group.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.unavailable(service, format!("service query failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }

        // Older servers answer unknown services with an error status and a message body
        let body = response.text().await.unwrap_or_default().to_ascii_lowercase();
        if body.contains("not found") || body.contains("not exist") {
            return Ok(false);
        }
        Err(self.unavailable(service, format!("service query returned {}: {}", status, body)))
    }

    async fn list_instances(&self, service: &str) -> GatewayResult<Vec<ServiceInstance>> {
        let response = self
            .client
            .get(self.url("instance/list"))
            .query(&[
                ("serviceName", service),
                ("namespaceId", self.config.namespace.as_str()),
                ("groupName", self.config.group.as_str()),
                ("healthyOnly", "false"),
            ])
            .send()
            .await
            .map_err(|e| self.unavailable(service, format!("instance query failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(self.unavailable(
                service,
                format!("instance query returned {}", response.status()),
            ));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.unavailable(service, format!("malformed registry reply: {}", e)))?;

        let hosts = match body.get("hosts") {
            Some(Value::Array(hosts)) => hosts,
            Some(_) => {
                return Err(self.unavailable(
                    service,
                    "malformed registry reply: 'hosts' is not a list",
                ))
            }
            None => {
                return Err(self.unavailable(service, "malformed registry reply: missing 'hosts'"))
            }
        };

        hosts
            .iter()
            .map(|host| {
                serde_json::from_value::<NacosHost>(host.clone())
                    .map(|host| host.into_instance(service))
                    .map_err(|e| {
                        self.unavailable(service, format!("malformed registry host entry: {}", e))
                    })
            })
            .collect()
    }

    fn instance_params(&self, instance: &ServiceInstance) -> Vec<(&'static str, String)> {
        vec![
            ("serviceName", instance.service.clone()),
            ("ip", instance.host.clone()),
            ("port", instance.port.to_string()),
            ("weight", (instance.weight as f64 / WEIGHT_SCALE).to_string()),
            ("namespaceId", self.config.namespace.clone()),
            ("groupName", self.config.group.clone()),
            ("enabled", "true".to_string()),
            ("healthy", "true".to_string()),
            ("ephemeral", "true".to_string()),
        ]
    }

    async fn expect_ok(&self, service: &str, action: &str, response: Response) -> GatewayResult<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(self.unavailable(service, format!("{} returned {}: {}", action, status, body)))
    }
}

#[async_trait]
impl ServiceResolver for NacosRegistry {
    async fn resolve(&self, service_name: &str) -> GatewayResult<InstanceSet> {
        let started = Instant::now();

        if !self.service_exists(service_name).await? {
            debug!(service = %service_name, "Service unknown to Nacos");
            return Err(GatewayError::ServiceUnknown {
                service: service_name.to_string(),
            });
        }

        let instances = self.list_instances(service_name).await?;
        debug!(
            service = %service_name,
            instances = instances.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "Resolved service via Nacos"
        );
        Ok(InstanceSet::new(service_name, instances))
    }
}

#[async_trait]
impl ServiceRegistrar for NacosRegistry {
    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        let response = self
            .client
            .post(self.url("instance"))
            .query(&self.instance_params(instance))
            .send()
            .await
            .map_err(|e| {
                self.unavailable(&instance.service, format!("registry unreachable: {}", e))
            })?;
        self.expect_ok(&instance.service, "registration", response).await?;

        info!(
            service = %instance.service,
            address = %instance.address(),
            namespace = %self.config.namespace,
            "Registered instance with Nacos"
        );
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        let response = self
            .client
            .delete(self.url("instance"))
            .query(&self.instance_params(instance))
            .send()
            .await
            .map_err(|e| {
                self.unavailable(&instance.service, format!("registry unreachable: {}", e))
            })?;
        self.expect_ok(&instance.service, "deregistration", response).await?;

        info!(service = %instance.service, address = %instance.address(), "Deregistered instance from Nacos");
        Ok(())
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        let beat = serde_json::json!({
            "serviceName": instance.service,
            "ip": instance.host,
            "port": instance.port,
            "weight": instance.weight as f64 / WEIGHT_SCALE,
            "cluster": "DEFAULT",
            "metadata": instance.metadata,
        })
        .to_string();
        let response = self
            .client
            .put(self.url("instance/beat"))
            .query(&[
                ("serviceName", instance.service.as_str()),
                ("namespaceId", self.config.namespace.as_str()),
                ("groupName", self.config.group.as_str()),
                ("beat", beat.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                self.unavailable(&instance.service, format!("registry unreachable: {}", e))
            })?;

        if let Err(e) = self.expect_ok(&instance.service, "heartbeat", response).await {
            warn!(service = %instance.service, error = %e, "Nacos heartbeat rejected");
            return Err(e);
        }
        Ok(())
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        Some(HEARTBEAT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_conversion() {
        let host: NacosHost = serde_json::from_value(json!({
            "ip": "10.0.0.5",
            "port": 8888,
            "weight": 0.5,
            "healthy": true,
            "enabled": true,
            "instanceId": "10.0.0.5#8888#DEFAULT#DEFAULT_GROUP@@TravelService"
        }))
        .unwrap();
        let instance = host.into_instance("TravelService");
        assert_eq!(instance.weight, 50);
        assert_eq!(instance.address(), "10.0.0.5:8888");
        assert!(instance.id.starts_with("10.0.0.5#8888"));
        assert!(instance.is_healthy());
    }

    #[test]
    fn test_host_health_mapping() {
        let disabled: NacosHost =
            serde_json::from_value(json!({"ip": "h", "port": 1, "enabled": false})).unwrap();
        assert_eq!(
            disabled.into_instance("s").health_status,
            HealthStatus::Disabled
        );

        let unhealthy: NacosHost =
            serde_json::from_value(json!({"ip": "h", "port": 1, "healthy": false})).unwrap();
        assert_eq!(
            unhealthy.into_instance("s").health_status,
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_rejects_invalid_address() {
        let config = NacosConfig {
            address: "::not a url".to_string(),
            ..NacosConfig::default()
        };
        assert!(NacosRegistry::new(config).is_err());
    }

    #[test]
    fn test_instance_params_round_trip_weight() {
        let registry = NacosRegistry::new(NacosConfig::default()).unwrap();
        let instance = ServiceInstance::new("TravelService", "127.0.0.1", 8888).with_weight(100);
        let params = registry.instance_params(&instance);
        assert!(params.contains(&("weight", "1".to_string())));
        assert!(params.contains(&("namespaceId", "public".to_string())));
    }
}
