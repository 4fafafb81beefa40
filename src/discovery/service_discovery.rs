//! # Service Discovery Module
//!
//! Resolves logical service names to the instances currently serving them, and lets backend
//! servers announce themselves.
//!
//! - [`ServiceResolver`] answers "which instances serve X right now". Unknown services are an
//!   error; a known service with nothing running is an empty [`InstanceSet`].
//! - [`ServiceRegistrar`] registers and deregisters instances.
//! - [`InMemoryRegistry`] implements both for tests and single-process deployments.
//! - [`CachingResolver`] keeps per-service snapshots in a `DashMap` and refreshes them in the
//!   background; callers tolerate snapshots up to one refresh interval old.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::config::{DiscoveryConfig, RegistryConfig, StaticInstance};
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::{HealthStatus, InstanceSet, ServiceInstance};
use crate::discovery::nacos::NacosRegistry;

/// Looks up the live instances of a service
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// `ServiceUnknown` for names the registry has never seen, `ResolverUnavailable` when the
    /// registry cannot be queried. A known service with no instances resolves to an empty set.
    async fn resolve(&self, service_name: &str) -> GatewayResult<InstanceSet>;
}

/// Announces backend instances to the registry
#[async_trait]
pub trait ServiceRegistrar: Send + Sync {
    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()>;

    async fn deregister(&self, instance: &ServiceInstance) -> GatewayResult<()>;

    /// Keep an ephemeral registration alive
    async fn heartbeat(&self, _instance: &ServiceInstance) -> GatewayResult<()> {
        Ok(())
    }

    /// How often [`ServiceRegistrar::heartbeat`] must be called, if at all
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }
}

/// Service change event types
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceChangeEvent {
    /// A new service instance was registered
    Registered(ServiceInstance),
    /// A service instance was deregistered
    Deregistered { service: String, instance_id: String },
    /// A service instance health status changed
    HealthChanged {
        service: String,
        instance_id: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
    },
}

/// Type alias for service change event receiver
pub type ServiceChangeReceiver = broadcast::Receiver<ServiceChangeEvent>;

/// Process-local registry implementing both resolution and registration
pub struct InMemoryRegistry {
    /// Service instances indexed by service name; a present key with no instances is a known,
    /// empty service
    services: DashMap<String, Vec<ServiceInstance>>,
    change_sender: broadcast::Sender<ServiceChangeEvent>,
    lookups: AtomicUsize,
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        let (change_sender, _) = broadcast::channel(100);
        Self {
            services: DashMap::new(),
            change_sender,
            lookups: AtomicUsize::new(0),
        }
    }

    /// Build from statically configured instance lists
    pub fn from_static(services: &HashMap<String, Vec<StaticInstance>>) -> Self {
        let registry = Self::new();
        for (name, instances) in services {
            registry.declare_service(name);
            for configured in instances {
                let health = if configured.healthy {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Unhealthy
                };
                registry.add_instance(
                    ServiceInstance::new(name.as_str(), configured.host.as_str(), configured.port)
                        .with_weight(configured.weight)
                        .with_health(health),
                );
            }
        }
        registry
    }

    /// Make a service known without any instance
    pub fn declare_service(&self, service_name: &str) {
        self.services.entry(service_name.to_string()).or_default();
    }

    /// Add or replace an instance (matched by id)
    pub fn add_instance(&self, instance: ServiceInstance) {
        {
            let mut instances = self.services.entry(instance.service.clone()).or_default();
            instances.retain(|existing| existing.id != instance.id);
            instances.push(instance.clone());
        }

        debug!(service = %instance.service, instance = %instance.id, "Added service instance");
        let _ = self
            .change_sender
            .send(ServiceChangeEvent::Registered(instance));
    }

    /// Remove an instance; the service stays known
    pub fn remove_instance(&self, service_name: &str, instance_id: &str) {
        let removed = match self.services.get_mut(service_name) {
            Some(mut instances) => {
                let before = instances.len();
                instances.retain(|existing| existing.id != instance_id);
                before != instances.len()
            }
            None => false,
        };

        if removed {
            debug!(service = %service_name, instance = %instance_id, "Removed service instance");
            let _ = self.change_sender.send(ServiceChangeEvent::Deregistered {
                service: service_name.to_string(),
                instance_id: instance_id.to_string(),
            });
        }
    }

    /// Update health status of a service instance
    pub fn update_instance_health(&self, service_name: &str, instance_id: &str, status: HealthStatus) {
        let old_status = self.services.get_mut(service_name).and_then(|mut instances| {
            instances
                .iter_mut()
                .find(|instance| instance.id == instance_id)
                .map(|instance| std::mem::replace(&mut instance.health_status, status))
        });

        if let Some(old_status) = old_status {
            let _ = self.change_sender.send(ServiceChangeEvent::HealthChanged {
                service: service_name.to_string(),
                instance_id: instance_id.to_string(),
                old_status,
                new_status: status,
            });
        }
    }

    /// Subscribe to service change events
    pub fn subscribe(&self) -> ServiceChangeReceiver {
        self.change_sender.subscribe()
    }

    /// Number of `resolve` calls answered so far
    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[async_trait]
impl ServiceResolver for InMemoryRegistry {
    async fn resolve(&self, service_name: &str) -> GatewayResult<InstanceSet> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.services
            .get(service_name)
            .map(|instances| InstanceSet::new(service_name, instances.value().clone()))
            .ok_or_else(|| GatewayError::ServiceUnknown {
                service: service_name.to_string(),
            })
    }
}

#[async_trait]
impl ServiceRegistrar for InMemoryRegistry {
    async fn register(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        self.add_instance(instance.clone());
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> GatewayResult<()> {
        self.remove_instance(&instance.service, &instance.id);
        Ok(())
    }
}

/// Snapshot cache in front of another resolver
///
/// Snapshots with at least one healthy instance are served until they are older than the
/// refresh interval. Empty snapshots are never served from cache so that callers waiting
/// for instances observe them as soon as the registry does. When the registry is
/// unreachable a stale snapshot is preferred over an error.
pub struct CachingResolver {
    inner: Arc<dyn ServiceResolver>,
    snapshots: DashMap<String, InstanceSet>,
    refresh_interval: Duration,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn ServiceResolver>, refresh_interval: Duration) -> Self {
        Self {
            inner,
            snapshots: DashMap::new(),
            refresh_interval,
        }
    }

    fn fresh_snapshot(&self, service_name: &str) -> Option<InstanceSet> {
        self.snapshots.get(service_name).and_then(|snapshot| {
            let fresh = snapshot.fetched_at.elapsed() < self.refresh_interval;
            (fresh && snapshot.has_healthy()).then(|| snapshot.value().clone())
        })
    }

    async fn fetch(&self, service_name: &str) -> GatewayResult<InstanceSet> {
        match self.inner.resolve(service_name).await {
            Ok(set) => {
                self.snapshots.insert(service_name.to_string(), set.clone());
                Ok(set)
            }
            Err(GatewayError::ServiceUnknown { service }) => {
                self.snapshots.remove(service_name);
                Err(GatewayError::ServiceUnknown { service })
            }
            Err(err @ GatewayError::ResolverUnavailable { .. }) => {
                match self.snapshots.get(service_name) {
                    Some(stale) => {
                        warn!(
                            service = %service_name,
                            error = %err,
                            age_ms = stale.fetched_at.elapsed().as_millis() as u64,
                            "Registry unavailable, serving stale snapshot"
                        );
                        Ok(stale.value().clone())
                    }
                    None => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Re-fetch every cached service once
    pub async fn refresh(&self) {
        let names: Vec<String> = self.snapshots.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.fetch(&name).await {
                warn!(service = %name, error = %e, "Failed to refresh service snapshot");
            }
        }
    }

    /// Start the periodic snapshot refresh task
    pub fn start_background_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        let refresh_interval = self.refresh_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                resolver.refresh().await;
            }
        })
    }

    pub fn cached_services(&self) -> usize {
        self.snapshots.len()
    }
}

#[async_trait]
impl ServiceResolver for CachingResolver {
    async fn resolve(&self, service_name: &str) -> GatewayResult<InstanceSet> {
        if let Some(snapshot) = self.fresh_snapshot(service_name) {
            counter!("discovery_cache_hits_total").increment(1);
            return Ok(snapshot);
        }
        counter!("discovery_lookups_total").increment(1);
        self.fetch(service_name).await
    }
}

/// Factory for the resolver described by configuration
///
/// Returns the resolver and, when caching is enabled, the handle of its refresh task.
pub fn create_resolver(
    config: &DiscoveryConfig,
) -> GatewayResult<(Arc<dyn ServiceResolver>, Option<JoinHandle<()>>)> {
    let base: Arc<dyn ServiceResolver> = match &config.registry {
        RegistryConfig::Nacos(nacos) => {
            info!(address = %nacos.address, namespace = %nacos.namespace, "Using Nacos service discovery");
            Arc::new(NacosRegistry::new(nacos.clone())?)
        }
        RegistryConfig::Static { services } => {
            info!(services = services.len(), "Using static service discovery");
            Arc::new(InMemoryRegistry::from_static(services))
        }
    };

    if !config.cache {
        return Ok((base, None));
    }

    let caching = Arc::new(CachingResolver::new(base, config.refresh_interval));
    let handle = caching.start_background_refresh();
    Ok((caching, Some(handle)))
}

/// Factory for the registrar used by backend servers
pub fn create_registrar(config: &RegistryConfig) -> GatewayResult<Arc<dyn ServiceRegistrar>> {
    match config {
        RegistryConfig::Nacos(nacos) => Ok(Arc::new(NacosRegistry::new(nacos.clone())?)),
        RegistryConfig::Static { .. } => {
            info!("Static discovery configured, registrations stay in this process");
            Ok(Arc::new(InMemoryRegistry::new()))
        }
    }
}
