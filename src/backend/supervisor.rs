//! Runs every configured backend server in one process.
//!
//! Startup problems (missing schema, unknown service, unreachable registry) are returned from
//! [`BackendSupervisor::initialize`]. Once running, servers have independent lifecycles: one
//! failing is reported while the others keep serving until shutdown.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::dispatcher::GenericDispatcher;
use crate::backend::server::BackendServer;
use crate::backend::services::builtin_registry;
use crate::core::config::{BackendConfig, RegistryConfig};
use crate::core::error::{GatewayError, GatewayResult};
use crate::discovery::{create_registrar, NacosRegistry, ServiceRegistrar};
use crate::schema::{SchemaProvider, ThriftFileProvider};

pub struct BackendSupervisor {
    servers: Vec<BackendServer>,
}

impl BackendSupervisor {
    /// Load schemas, validate handler tables and connect to the registry
    pub async fn initialize(config: &BackendConfig) -> GatewayResult<Self> {
        let registrar: Arc<dyn ServiceRegistrar> = match &config.registry {
            RegistryConfig::Nacos(nacos) => {
                let registry = NacosRegistry::new(nacos.clone())?;
                registry.ping().await?;
                Arc::new(registry)
            }
            other => create_registrar(other)?,
        };
        Self::with_registrar(config, registrar).await
    }

    /// Like [`initialize`](Self::initialize) with an already connected registrar
    pub async fn with_registrar(
        config: &BackendConfig,
        registrar: Arc<dyn ServiceRegistrar>,
    ) -> GatewayResult<Self> {
        let provider = ThriftFileProvider::new(config.schema.clone());
        let mut servers = Vec::with_capacity(config.servers.len());

        for server in &config.servers {
            let descriptor = provider.descriptor_for(&server.service)?;
            let codec = provider.load_schema(&descriptor).await?;
            let registry = builtin_registry(&server.service).ok_or_else(|| {
                GatewayError::config(format!("No built-in handlers for service {}", server.service))
            })?;
            let dispatcher = Arc::new(GenericDispatcher::with_schema(registry, &codec)?);

            servers.push(BackendServer::new(
                server.clone(),
                config.bind_address.as_str(),
                config.advertise_host.as_str(),
                dispatcher,
                Arc::clone(&registrar),
            ));
        }

        Ok(Self { servers })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Run all servers until `shutdown` fires and every server has stopped.
    ///
    /// Returns the first server error, if any.
    pub async fn run(self, shutdown: CancellationToken) -> GatewayResult<()> {
        let mut tasks = JoinSet::new();
        for server in self.servers {
            let label = format!("{}:{}", server.service(), server.port());
            let shutdown = shutdown.clone();
            tasks.spawn(async move { (label, server.run(shutdown).await) });
        }

        let mut first_error: Option<GatewayError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (label, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Backend server task panicked or was aborted");
                    first_error.get_or_insert(GatewayError::internal(e.to_string()));
                    continue;
                }
            };

            match result {
                Ok(()) => info!(server = %label, "Server stopped"),
                Err(e) => {
                    error!(server = %label, error = %e, "Server stopped with error");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
