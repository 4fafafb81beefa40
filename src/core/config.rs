//! # Configuration Module
//!
//! Configuration structures for the gateway and the backend process, plus their loading
//! mechanisms.
//!
//! ## Key Features
//! - YAML configuration parsing with serde, human-readable durations via `humantime_serde`
//! - Environment variable override support (`GATEWAY_*` and `BACKEND_*`)
//! - Validation that reports every problem at once
//!
//! Configuration structs are plain values handed to constructors; nothing in the crate reads
//! configuration from a global.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::core::error::{GatewayError, GatewayResult};
use crate::shaping::FieldKind;

/// Main gateway configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where schema documents live
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Discovery registry and refresh settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Generic client construction and call settings
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-method request shaping rules
    #[serde(default)]
    pub shaping: ShapingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse, apply environment overrides and validate
    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let mut config: GatewayConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    ///
    /// Environment variables follow the pattern: GATEWAY_<SECTION>_<FIELD>
    /// For example: GATEWAY_SERVER_PORT=8080
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(port) = env::var("GATEWAY_SERVER_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| GatewayError::config(format!("Invalid GATEWAY_SERVER_PORT: {}", e)))?;
        }

        if let Ok(addr) = env::var("GATEWAY_SERVER_BIND_ADDRESS") {
            self.server.bind_address = addr;
        }

        if let Ok(dir) = env::var("GATEWAY_SCHEMA_DIRECTORY") {
            self.schema.directory = PathBuf::from(dir);
        }

        if let Ok(address) = env::var("GATEWAY_NACOS_ADDRESS") {
            match &mut self.discovery.registry {
                RegistryConfig::Nacos(nacos) => nacos.address = address,
                RegistryConfig::Static { .. } => {
                    self.discovery.registry = RegistryConfig::Nacos(NacosConfig {
                        address,
                        ..NacosConfig::default()
                    });
                }
            }
        }

        if let Ok(timeout) = env::var("GATEWAY_CLIENT_CALL_TIMEOUT") {
            self.client.call_timeout = humantime::parse_duration(&timeout).map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_CLIENT_CALL_TIMEOUT: {}", e))
            })?;
        }

        if let Ok(eager) = env::var("GATEWAY_CLIENT_EAGER_RESOLVE") {
            self.client.eager_resolve = eager.parse().map_err(|e| {
                GatewayError::config(format!("Invalid GATEWAY_CLIENT_EAGER_RESOLVE: {}", e))
            })?;
        }

        if let Ok(level) = env::var("GATEWAY_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("GATEWAY_LOG_FORMAT") {
            self.observability.logging.format = format.parse()?;
        }

        Ok(())
    }

    /// Configuration validation with detailed error messages
    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.server.bind_address.is_empty() {
            errors.push("server.bind_address cannot be empty".to_string());
        }

        if self.server.max_body_size == 0 {
            errors.push("server.max_body_size must be greater than 0".to_string());
        }

        self.schema.collect_errors("schema", &mut errors);
        self.discovery.collect_errors(&mut errors);

        if self.client.call_timeout.is_zero() {
            errors.push("client.call_timeout must be greater than 0".to_string());
        }

        if self.client.instance_poll_interval.is_zero() {
            errors.push("client.instance_poll_interval must be greater than 0".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for rule in &self.shaping.rules {
            if rule.service.is_empty() || rule.method.is_empty() {
                errors.push("shaping rules need both service and method".to_string());
            }
            if !seen.insert((rule.service.as_str(), rule.method.as_str())) {
                errors.push(format!(
                    "Duplicate shaping rule for {}.{}",
                    rule.service, rule.method
                ));
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to (0.0.0.0 for all interfaces)
    pub bind_address: String,

    pub port: u16,

    /// Maximum accepted request body in bytes
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_body_size: 1024 * 1024,
        }
    }
}

/// Schema document location convention: `{directory}/{service}.{extension}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaConfig {
    pub directory: PathBuf,
    pub extension: String,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./thriftFiles"),
            extension: "thrift".to_string(),
        }
    }
}

impl SchemaConfig {
    fn collect_errors(&self, section: &str, errors: &mut Vec<String>) {
        if self.directory.as_os_str().is_empty() {
            errors.push(format!("{}.directory cannot be empty", section));
        }
        if self.extension.is_empty() || self.extension.starts_with('.') {
            errors.push(format!(
                "{}.extension must be non-empty and given without a leading dot",
                section
            ));
        }
    }
}

/// Service discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub registry: RegistryConfig,

    /// How often cached instance sets are refreshed in the background
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,

    /// Put a snapshot cache in front of the registry
    pub cache: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            refresh_interval: Duration::from_secs(10),
            cache: true,
        }
    }
}

impl DiscoveryConfig {
    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.cache && self.refresh_interval.is_zero() {
            errors.push("discovery.refresh_interval must be greater than 0".to_string());
        }
        self.registry.collect_errors("discovery.registry", errors);
    }
}

/// Which registry backs service discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegistryConfig {
    /// Nacos-compatible naming API
    Nacos(NacosConfig),

    /// Fixed, in-process instance lists
    Static {
        #[serde(default)]
        services: HashMap<String, Vec<StaticInstance>>,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig::Nacos(NacosConfig::default())
    }
}

impl RegistryConfig {
    fn collect_errors(&self, section: &str, errors: &mut Vec<String>) {
        match self {
            RegistryConfig::Nacos(nacos) => {
                if let Err(e) = Url::parse(&nacos.address) {
                    errors.push(format!(
                        "{}.address '{}' is not a valid URL: {}",
                        section, nacos.address, e
                    ));
                }
                if nacos.namespace.is_empty() {
                    errors.push(format!("{}.namespace cannot be empty", section));
                }
                if nacos.timeout.is_zero() {
                    errors.push(format!("{}.timeout must be greater than 0", section));
                }
            }
            RegistryConfig::Static { services } => {
                for (name, instances) in services {
                    for instance in instances {
                        if instance.host.is_empty() || instance.port == 0 {
                            errors.push(format!(
                                "{}.services.{} has an instance without host or port",
                                section, name
                            ));
                        }
                    }
                }
            }
        }
    }
}

/// Connection settings for a Nacos naming server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NacosConfig {
    /// Base URL, e.g. `http://127.0.0.1:8848`
    pub address: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_group")]
    pub group: String,

    /// Per-request timeout against the registry
    #[serde(with = "humantime_serde", default = "default_registry_timeout")]
    pub timeout: Duration,
}

fn default_namespace() -> String {
    "public".to_string()
}

fn default_group() -> String {
    "DEFAULT_GROUP".to_string()
}

fn default_registry_timeout() -> Duration {
    Duration::from_millis(5000)
}

impl Default for NacosConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8848".to_string(),
            namespace: default_namespace(),
            group: default_group(),
            timeout: default_registry_timeout(),
        }
    }
}

/// One statically configured instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticInstance {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

/// Load balancing policy used by generic clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerKind {
    #[default]
    WeightedRoundRobin,
    RoundRobin,
    ConsistentHash,
}

/// Generic client construction and call settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Budget for resolve + select + transport of one call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Resolve once when a client is built and fail fast on unknown/empty services
    pub eager_resolve: bool,

    /// How often a call re-queries discovery while a service has no healthy instance
    #[serde(with = "humantime_serde")]
    pub instance_poll_interval: Duration,

    pub load_balancer: LoadBalancerKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(3),
            eager_resolve: true,
            instance_poll_interval: Duration::from_millis(100),
            load_balancer: LoadBalancerKind::default(),
        }
    }
}

/// Configured shaping rules; they take precedence over schema-derived ones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapingConfig {
    #[serde(default)]
    pub rules: Vec<ShapeRuleConfig>,
}

/// Declared fields for one (service, method) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeRuleConfig {
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub required: Vec<FieldSpec>,
    #[serde(default)]
    pub optional: Vec<FieldSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

/// Observability settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "pretty" => Ok(LogFormat::Text),
            other => Err(GatewayError::config(format!("Unknown log format: {}", other))),
        }
    }
}

/// Backend process configuration: several RPC servers sharing one registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Address every server binds to
    pub bind_address: String,

    /// Host registered with discovery so gateways can reach us
    pub advertise_host: String,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    pub servers: Vec<BackendServerConfig>,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// One listening RPC server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendServerConfig {
    /// Service implemented by this server (also its schema name)
    pub service: String,
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_qps")]
    pub max_qps: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_qps() -> u32 {
    1000
}

impl BackendServerConfig {
    pub fn new<S: Into<String>>(service: S, port: u16) -> Self {
        Self {
            service: service.into(),
            port,
            max_connections: default_max_connections(),
            max_qps: default_max_qps(),
            weight: default_weight(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            schema: SchemaConfig::default(),
            registry: RegistryConfig::default(),
            servers: vec![
                BackendServerConfig::new("TravelService", 8888),
                BackendServerConfig::new("TravelService", 8889),
                BackendServerConfig::new("ReviewService", 8887),
                BackendServerConfig::new("ReviewService", 8886),
            ],
            observability: ObservabilityConfig::default(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from a YAML file
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GatewayError::config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> GatewayResult<Self> {
        let mut config: BackendConfig = serde_yaml::from_str(content)
            .map_err(|e| GatewayError::config(format!("Failed to parse config: {}", e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment variables follow the pattern: BACKEND_<FIELD>
    pub fn apply_env_overrides(&mut self) -> GatewayResult<()> {
        use std::env;

        if let Ok(addr) = env::var("BACKEND_BIND_ADDRESS") {
            self.bind_address = addr;
        }

        if let Ok(host) = env::var("BACKEND_ADVERTISE_HOST") {
            self.advertise_host = host;
        }

        if let Ok(dir) = env::var("BACKEND_SCHEMA_DIRECTORY") {
            self.schema.directory = PathBuf::from(dir);
        }

        if let Ok(address) = env::var("BACKEND_NACOS_ADDRESS") {
            match &mut self.registry {
                RegistryConfig::Nacos(nacos) => nacos.address = address,
                RegistryConfig::Static { .. } => {
                    self.registry = RegistryConfig::Nacos(NacosConfig {
                        address,
                        ..NacosConfig::default()
                    });
                }
            }
        }

        if let Ok(level) = env::var("BACKEND_LOG_LEVEL") {
            self.observability.logging.level = level;
        }

        if let Ok(format) = env::var("BACKEND_LOG_FORMAT") {
            self.observability.logging.format = format.parse()?;
        }

        Ok(())
    }

    pub fn validate(&self) -> GatewayResult<()> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("bind_address cannot be empty".to_string());
        }
        if self.advertise_host.is_empty() {
            errors.push("advertise_host cannot be empty".to_string());
        }

        self.schema.collect_errors("schema", &mut errors);
        self.registry.collect_errors("registry", &mut errors);

        if self.servers.is_empty() {
            errors.push("at least one server must be configured".to_string());
        }

        let mut ports = std::collections::HashSet::new();
        for server in &self.servers {
            if server.service.is_empty() {
                errors.push(format!("server on port {} has no service name", server.port));
            }
            if server.port != 0 && !ports.insert(server.port) {
                errors.push(format!("port {} is used by more than one server", server.port));
            }
            if server.max_connections == 0 {
                errors.push(format!(
                    "server {}:{} max_connections must be greater than 0",
                    server.service, server.port
                ));
            }
            if server.max_qps == 0 {
                errors.push(format!(
                    "server {}:{} max_qps must be greater than 0",
                    server.service, server.port
                ));
            }
        }

        if !errors.is_empty() {
            return Err(GatewayError::config(format!(
                "Configuration validation failed:\n{}",
                errors.join("\n")
            )));
        }

        Ok(())
    }
}
