//! # Core Types Module
//!
//! Data structures shared by the gateway and the backend runtime: service descriptors,
//! discovered instances, routing hints and the request/reply envelopes that travel
//! through the dispatch pipeline.
//!
//! ## Ownership Notes
//!
//! - Descriptors and instances are small and `Clone`; they are copied freely between tasks.
//! - Payloads are `serde_json::Map` values owned by exactly one request at a time.
//! - Anything shared between concurrent calls (codecs, clients) is wrapped in `Arc` elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

/// Name of the status object embedded in every backend reply
pub const BASE_RESP_KEY: &str = "BaseResp";

/// Identifies the schema governing a backend service
///
/// Immutable once built; two descriptors are equal only when both the service name and the
/// schema location match, which is what the client cache compares against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub service_name: String,
    pub schema_location: PathBuf,
}

impl ServiceDescriptor {
    pub fn new<S: Into<String>, P: Into<PathBuf>>(service_name: S, schema_location: P) -> Self {
        Self {
            service_name: service_name.into(),
            schema_location: schema_location.into(),
        }
    }

    /// Build the conventional descriptor `{directory}/{service}.{extension}`
    pub fn for_service(directory: &Path, service_name: &str, extension: &str) -> Self {
        let location = directory.join(format!("{}.{}", service_name, extension));
        Self::new(service_name, location)
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.service_name, self.schema_location.display())
    }
}

/// Health status of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Instance is healthy and ready to receive traffic
    Healthy,
    /// Instance is registered but failing its health checks
    Unhealthy,
    /// Instance was taken out of rotation by an operator
    Disabled,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// One live backend instance as reported by discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique instance identifier, `host:port` unless the registry says otherwise
    pub id: String,

    /// Service name
    pub service: String,

    pub host: String,
    pub port: u16,

    /// Instance weight for load balancing
    pub weight: u32,

    pub health_status: HealthStatus,

    /// Free-form registry metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ServiceInstance {
    /// Create a healthy instance with weight 1
    pub fn new<S: Into<String>, H: Into<String>>(service: S, host: H, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}:{}", host, port),
            service: service.into(),
            host,
            port,
            weight: 1,
            health_status: HealthStatus::Healthy,
            metadata: HashMap::new(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_health(mut self, health_status: HealthStatus) -> Self {
        self.health_status = health_status;
        self
    }

    /// Check if instance can receive traffic
    pub fn is_healthy(&self) -> bool {
        self.health_status == HealthStatus::Healthy && self.weight > 0
    }

    /// Socket address string suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Instances of a service at one point in time
///
/// An empty set means the service is known but has nothing running; an unknown service is
/// reported as an error by the resolver instead.
#[derive(Debug, Clone)]
pub struct InstanceSet {
    pub service: String,
    pub instances: Vec<ServiceInstance>,
    pub fetched_at: Instant,
}

impl InstanceSet {
    pub fn new<S: Into<String>>(service: S, instances: Vec<ServiceInstance>) -> Self {
        Self {
            service: service.into(),
            instances,
            fetched_at: Instant::now(),
        }
    }

    pub fn empty<S: Into<String>>(service: S) -> Self {
        Self::new(service, Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Instances eligible for selection, in registry order
    pub fn healthy(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .filter(|instance| instance.is_healthy())
            .cloned()
            .collect()
    }

    pub fn has_healthy(&self) -> bool {
        self.instances.iter().any(ServiceInstance::is_healthy)
    }
}

/// Sticky routing key supplied by the caller (`x-consistency-key`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingHint(String);

impl RoutingHint {
    pub fn new<S: Into<String>>(key: S) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound call after route parameters and body have been parsed
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// Unique identifier for this request (for tracing and logging)
    pub request_id: String,
    pub service_name: String,
    pub method_name: String,
    pub fields: Map<String, Value>,
    pub routing_hint: Option<RoutingHint>,
}

impl RequestEnvelope {
    pub fn new<S: Into<String>>(service_name: S, method_name: S, fields: Map<String, Value>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            service_name: service_name.into(),
            method_name: method_name.into(),
            fields,
            routing_hint: None,
        }
    }

    pub fn with_request_id<S: Into<String>>(mut self, request_id: S) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_routing_hint(mut self, hint: Option<RoutingHint>) -> Self {
        self.routing_hint = hint;
        self
    }
}

/// Reply built by a backend handler: a status plus method-specific payload fields
///
/// On the wire the status travels as a `BaseResp` object next to the payload fields:
/// `{"Msg": "...", "BaseResp": {"StatusCode": 200, "StatusMessage": "Success"}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyEnvelope {
    pub status_code: u16,
    pub status_message: String,
    pub payload: Map<String, Value>,
}

impl ReplyEnvelope {
    pub const OK_MESSAGE: &'static str = "Success";

    /// Successful reply carrying `payload`
    pub fn ok(payload: Map<String, Value>) -> Self {
        Self {
            status_code: 200,
            status_message: Self::OK_MESSAGE.to_string(),
            payload,
        }
    }

    /// Failed reply with an explanatory `Msg` field
    pub fn error<S: Into<String>>(status_code: u16, status_message: S, detail: S) -> Self {
        let mut payload = Map::new();
        payload.insert("Msg".to_string(), Value::String(detail.into()));
        Self {
            status_code,
            status_message: status_message.into(),
            payload,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Flatten into the wire JSON object
    pub fn to_json(&self) -> Value {
        let mut object = self.payload.clone();
        let mut base = Map::new();
        base.insert("StatusCode".to_string(), Value::from(self.status_code));
        base.insert(
            "StatusMessage".to_string(),
            Value::String(self.status_message.clone()),
        );
        object.insert(BASE_RESP_KEY.to_string(), Value::Object(base));
        Value::Object(object)
    }

    /// Split a decoded wire object back into status and payload.
    ///
    /// Returns `None` when the object carries no well-formed `BaseResp`.
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let base = object.get(BASE_RESP_KEY)?.as_object()?;
        let status_code = u16::try_from(base.get("StatusCode")?.as_u64()?).ok()?;
        let status_message = base
            .get("StatusMessage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut payload = object.clone();
        payload.remove(BASE_RESP_KEY);
        Some(Self {
            status_code,
            status_message,
            payload,
        })
    }
}
