//! Schema loading.
//!
//! A [`SchemaProvider`] turns a [`ServiceDescriptor`] into a shared [`Codec`]. The file based
//! provider reads `{directory}/{service}.{extension}` and parses it once per service.

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::counter;
use std::io::ErrorKind;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::SchemaConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceDescriptor;
use crate::schema::codec::Codec;
use crate::schema::idl;

/// Source of codecs for named services
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Descriptor for a service name, following the provider's location convention
    fn descriptor_for(&self, service_name: &str) -> GatewayResult<ServiceDescriptor>;

    /// Load (or reuse) the codec governed by `descriptor`. Performs no network I/O.
    async fn load_schema(&self, descriptor: &ServiceDescriptor) -> GatewayResult<Arc<Codec>>;
}

/// Service names become file names, so they are restricted to a safe alphabet
pub fn validate_service_name(service_name: &str) -> GatewayResult<()> {
    let valid = !service_name.is_empty()
        && !service_name.starts_with('.')
        && service_name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::invalid_request(format!(
            "invalid service name '{}'",
            service_name
        )))
    }
}

/// Parse IDL text into a codec bound to `service_name`
pub fn codec_from_source(service_name: &str, source: &str) -> GatewayResult<Codec> {
    let document = idl::parse(source).map_err(|e| GatewayError::SchemaParse {
        service: service_name.to_string(),
        message: e.to_string(),
    })?;
    Codec::new(service_name, document).map_err(|message| GatewayError::SchemaParse {
        service: service_name.to_string(),
        message,
    })
}

/// Loads Thrift IDL files from a directory, caching one codec per service
pub struct ThriftFileProvider {
    config: SchemaConfig,
    codecs: DashMap<String, (ServiceDescriptor, Arc<Codec>)>,
}

impl ThriftFileProvider {
    pub fn new(config: SchemaConfig) -> Self {
        Self {
            config,
            codecs: DashMap::new(),
        }
    }

    pub fn cached_services(&self) -> usize {
        self.codecs.len()
    }
}

#[async_trait]
impl SchemaProvider for ThriftFileProvider {
    fn descriptor_for(&self, service_name: &str) -> GatewayResult<ServiceDescriptor> {
        validate_service_name(service_name)?;
        Ok(ServiceDescriptor::for_service(
            &self.config.directory,
            service_name,
            &self.config.extension,
        ))
    }

    async fn load_schema(&self, descriptor: &ServiceDescriptor) -> GatewayResult<Arc<Codec>> {
        if let Some(entry) = self.codecs.get(&descriptor.service_name) {
            let (cached_descriptor, codec) = entry.value();
            if cached_descriptor == descriptor {
                counter!("schema_cache_hits_total").increment(1);
                return Ok(codec.clone());
            }
        }

        let location = descriptor.schema_location.display().to_string();
        let source = tokio::fs::read_to_string(&descriptor.schema_location)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => GatewayError::SchemaNotFound {
                    service: descriptor.service_name.clone(),
                    location: location.clone(),
                },
                _ => GatewayError::Io {
                    message: format!("Failed to read schema {}: {}", location, e),
                },
            })?;

        let codec = Arc::new(codec_from_source(&descriptor.service_name, &source)?);
        counter!("schema_loads_total").increment(1);
        info!(
            service = %descriptor.service_name,
            location = %location,
            methods = codec.method_names().count(),
            "Loaded service schema"
        );

        // A concurrent loader may have won; keep whichever codec landed first
        let entry = self
            .codecs
            .entry(descriptor.service_name.clone())
            .and_modify(|existing| {
                if existing.0 != *descriptor {
                    debug!(service = %descriptor.service_name, "Replacing schema for changed descriptor");
                    *existing = (descriptor.clone(), codec.clone());
                }
            })
            .or_insert_with(|| (descriptor.clone(), codec.clone()));
        Ok(entry.value().1.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    const HELLO: &str = r#"
struct HelloRequest { 1: required string Msg }
struct HelloResponse { 1: string Msg }
service Hello { HelloResponse Echo(1: HelloRequest req) }
"#;

    fn provider(dir: &TempDir) -> ThriftFileProvider {
        ThriftFileProvider::new(SchemaConfig {
            directory: dir.path().to_path_buf(),
            extension: "thrift".to_string(),
        })
    }

    #[tokio::test]
    async fn test_load_and_cache() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("Hello.thrift"), HELLO)
            .await
            .unwrap();
        let provider = provider(&dir);

        let descriptor = provider.descriptor_for("Hello").unwrap();
        let first = provider.load_schema(&descriptor).await.unwrap();
        assert!(first.has_method("Echo"));

        // Removing the file does not matter once parsed
        tokio::fs::remove_file(dir.path().join("Hello.thrift"))
            .await
            .unwrap();
        let second = provider.load_schema(&descriptor).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(provider.cached_services(), 1);
    }

    #[tokio::test]
    async fn test_missing_schema() {
        let dir = TempDir::new().unwrap();
        let provider = provider(&dir);
        let descriptor = provider.descriptor_for("Nope").unwrap();
        let err = provider.load_schema(&descriptor).await.unwrap_err();
        assert!(matches!(err, GatewayError::SchemaNotFound { .. }));
    }

    #[tokio::test]
    async fn test_malformed_schema() {
        let dir = TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("Broken.thrift"), "struct {")
            .await
            .unwrap();
        let provider = provider(&dir);
        let descriptor = provider.descriptor_for("Broken").unwrap();
        let err = provider.load_schema(&descriptor).await.unwrap_err();
        assert!(matches!(err, GatewayError::SchemaParse { .. }));
        assert_eq!(provider.cached_services(), 0);
    }

    #[test]
    fn test_descriptor_convention() {
        let provider = ThriftFileProvider::new(SchemaConfig::default());
        let descriptor = provider.descriptor_for("TravelService").unwrap();
        assert_eq!(
            descriptor.schema_location,
            PathBuf::from("./thriftFiles/TravelService.thrift")
        );
    }

    #[test]
    fn test_rejects_path_like_names() {
        let provider = ThriftFileProvider::new(SchemaConfig::default());
        for name in ["../etc/passwd", "a/b", "", ".hidden", "a b"] {
            assert!(provider.descriptor_for(name).is_err(), "{}", name);
        }
    }
}
