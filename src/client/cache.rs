//! Process-wide cache of generic clients, one per service name.
//!
//! Construction is single-flight: concurrent first lookups for a service share one build
//! (and therefore one discovery query). A failed build leaves nothing behind so the next
//! request tries again.

use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::client::generic::GenericClient;
use crate::core::config::ClientConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceDescriptor;
use crate::discovery::ServiceResolver;
use crate::load_balancing::create_load_balancer;
use crate::protocols::Transport;
use crate::schema::Codec;

type ClientSlot = Arc<OnceCell<Arc<GenericClient>>>;

pub struct ClientCache {
    resolver: Arc<dyn ServiceResolver>,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    clients: DashMap<String, ClientSlot>,
}

impl ClientCache {
    pub fn new(
        resolver: Arc<dyn ServiceResolver>,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            resolver,
            transport,
            config,
            clients: DashMap::new(),
        }
    }

    /// Client for `descriptor`, building it on first use.
    ///
    /// A cached client built from a different descriptor is never handed out.
    pub async fn get_client(
        &self,
        descriptor: &ServiceDescriptor,
        codec: Arc<Codec>,
    ) -> GatewayResult<Arc<GenericClient>> {
        let name = descriptor.service_name.clone();
        let slot = self
            .clients
            .entry(name.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();

        if let Some(client) = slot.get() {
            counter!("client_cache_hits_total").increment(1);
            return self.check_descriptor(client, descriptor);
        }

        match slot.get_or_try_init(|| self.build(descriptor, codec)).await {
            Ok(client) => self.check_descriptor(client, descriptor),
            Err(e) => {
                self.clients
                    .remove_if(&name, |_, cached| Arc::ptr_eq(cached, &slot) && cached.get().is_none());
                Err(e)
            }
        }
    }

    /// Single discovery lookup for a service with no schema; only a definite "unknown" answer
    /// from the registry is reported, anything else leaves the schema error in place.
    pub async fn check_known(&self, service: &str) -> GatewayResult<()> {
        match self.resolver.resolve(service).await {
            Err(e @ GatewayError::ServiceUnknown { .. }) => Err(e),
            Err(e) => {
                debug!(service = %service, error = %e, "Lookup for schemaless service failed");
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    fn check_descriptor(
        &self,
        client: &Arc<GenericClient>,
        descriptor: &ServiceDescriptor,
    ) -> GatewayResult<Arc<GenericClient>> {
        if client.descriptor() != descriptor {
            return Err(GatewayError::config(format!(
                "client for {} was built from {}, refusing lookup with {}",
                descriptor.service_name,
                client.descriptor(),
                descriptor
            )));
        }
        Ok(Arc::clone(client))
    }

    async fn build(
        &self,
        descriptor: &ServiceDescriptor,
        codec: Arc<Codec>,
    ) -> GatewayResult<Arc<GenericClient>> {
        let service = descriptor.service_name.as_str();

        if self.config.eager_resolve {
            let set = self.resolver.resolve(service).await?;
            if !set.has_healthy() {
                debug!(service = %service, instances = set.len(), "Service has no healthy instance");
                return Err(GatewayError::NoHealthyInstances {
                    service: service.to_string(),
                });
            }
        }

        let client = GenericClient::new(
            descriptor.clone(),
            codec,
            Arc::clone(&self.resolver),
            create_load_balancer(self.config.load_balancer),
            Arc::clone(&self.transport),
            self.config.call_timeout,
            self.config.instance_poll_interval,
        );
        counter!("client_cache_builds_total").increment(1);
        info!(
            service = %service,
            schema = %descriptor.schema_location.display(),
            eager = self.config.eager_resolve,
            "Built generic client"
        );
        Ok(Arc::new(client))
    }

    /// Drop the cached client for a service, if any
    pub fn invalidate(&self, service_name: &str) -> bool {
        self.clients.remove(service_name).is_some()
    }

    /// Number of services with a built client
    pub fn len(&self) -> usize {
        self.clients
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ServiceInstance;
    use crate::discovery::InMemoryRegistry;
    use crate::protocols::TcpTransport;
    use crate::schema::codec_from_source;

    const SCHEMA: &str = r#"
        struct Req { 1: required string Msg }
        service EchoService { Req Echo(1: Req req) }
    "#;

    fn codec() -> Arc<Codec> {
        Arc::new(codec_from_source("EchoService", SCHEMA).unwrap())
    }

    fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new("EchoService", "thriftFiles/EchoService.thrift")
    }

    fn cache(registry: Arc<InMemoryRegistry>, eager_resolve: bool) -> ClientCache {
        ClientCache::new(
            registry,
            Arc::new(TcpTransport::default()),
            ClientConfig {
                eager_resolve,
                ..ClientConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_reuses_client_without_requerying() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let cache = cache(registry.clone(), true);

        let first = cache.get_client(&descriptor(), codec()).await.unwrap();
        let second = cache.get_client(&descriptor(), codec()).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.lookup_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_lookups_share_one_build() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let cache = Arc::new(cache(registry.clone(), true));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.get_client(&descriptor(), codec()).await.unwrap()
            }));
        }
        let clients: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert!(clients.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_eager_failures_are_not_cached() {
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = cache(registry.clone(), true);

        let err = cache.get_client(&descriptor(), codec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnknown { .. }));
        assert!(cache.is_empty());

        registry.declare_service("EchoService");
        let err = cache.get_client(&descriptor(), codec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances { .. }));

        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        assert!(cache.get_client(&descriptor(), codec()).await.is_ok());
        assert_eq!(registry.lookup_count(), 3);
    }

    #[tokio::test]
    async fn test_zero_weight_instances_are_not_healthy() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1).with_weight(0));
        let cache = cache(registry, true);

        let err = cache.get_client(&descriptor(), codec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoHealthyInstances { .. }));
        assert!(format!("{:?}", err).contains("EchoService"));
    }

    #[tokio::test]
    async fn test_client_debug_names_service() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let client = cache(registry, true)
            .get_client(&descriptor(), codec())
            .await
            .unwrap();
        let rendered = format!("{:?}", client);
        assert!(rendered.contains("EchoService"));
        assert!(rendered.contains("weighted_round_robin"));
    }

    #[tokio::test]
    async fn test_check_known_reports_only_unknown_names() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.declare_service("CatalogService");
        let cache = cache(registry.clone(), false);

        let err = cache.check_known("UnknownService").await.unwrap_err();
        assert!(matches!(err, GatewayError::ServiceUnknown { ref service } if service == "UnknownService"));
        assert!(cache.check_known("CatalogService").await.is_ok());
        assert_eq!(registry.lookup_count(), 2);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_lazy_mode_never_resolves_at_build() {
        let registry = Arc::new(InMemoryRegistry::new());
        let cache = cache(registry.clone(), false);
        assert!(cache.get_client(&descriptor(), codec()).await.is_ok());
        assert_eq!(registry.lookup_count(), 0);
    }

    #[tokio::test]
    async fn test_rejects_mismatched_descriptor() {
        let registry = Arc::new(InMemoryRegistry::new());
        registry.add_instance(ServiceInstance::new("EchoService", "127.0.0.1", 1));
        let cache = cache(registry, true);
        cache.get_client(&descriptor(), codec()).await.unwrap();

        let other = ServiceDescriptor::new("EchoService", "/elsewhere/EchoService.thrift");
        let err = cache.get_client(&other, codec()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));

        assert!(cache.invalidate("EchoService"));
        assert!(cache.get_client(&other, codec()).await.is_ok());
    }
}
