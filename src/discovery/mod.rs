pub mod nacos;
pub mod service_discovery;

pub use nacos::NacosRegistry;
pub use service_discovery::{
    create_registrar, create_resolver, CachingResolver, InMemoryRegistry, ServiceChangeEvent,
    ServiceRegistrar, ServiceResolver,
};
