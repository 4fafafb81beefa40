//! # Error Handling Module
//!
//! All failures of the gateway and the backend runtime are expressed as [`GatewayError`].
//! Each variant carries enough context (service, method, field or stage) to be logged and
//! returned to the caller without further lookups, and maps to exactly one HTTP status and
//! one stable, machine-readable reason code.
//!
//! The taxonomy follows the four families the dispatch pipeline distinguishes:
//! - configuration errors (schema, discovery and client setup),
//! - validation errors (caller input, detected before any network I/O),
//! - transport errors (timeouts, cancellation, refused connections),
//! - decode errors (the backend broke its reply contract).

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use thiserror::Error;

/// Main result type used throughout the gateway
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Header carrying the machine-readable reason code of a failed request
pub const ERROR_TYPE_HEADER: &str = "x-gateway-error";

/// What is wrong with a single request field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum FieldProblem {
    /// A required field is absent (or explicitly `null`)
    Missing,
    /// The field is present but carries the wrong JSON kind
    WrongType { expected: String, found: String },
}

/// A single offending field reported by request validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIssue {
    pub field: String,
    #[serde(flatten)]
    pub problem: FieldProblem,
}

impl FieldIssue {
    pub fn missing<S: Into<String>>(field: S) -> Self {
        Self {
            field: field.into(),
            problem: FieldProblem::Missing,
        }
    }

    pub fn wrong_type<S: Into<String>>(field: S, expected: S, found: S) -> Self {
        Self {
            field: field.into(),
            problem: FieldProblem::WrongType {
                expected: expected.into(),
                found: found.into(),
            },
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            FieldProblem::Missing => write!(f, "{} (missing)", self.field),
            FieldProblem::WrongType { expected, found } => {
                write!(f, "{} (expected {}, found {})", self.field, expected, found)
            }
        }
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Broad family an error belongs to; decides how it is logged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Validation,
    Transport,
    Decode,
    Internal,
}

/// Error types for the gateway and the generic backend runtime
#[derive(Debug, Error, Clone)]
pub enum GatewayError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The schema document for a service does not exist
    #[error("Schema not found for service {service} at {location}")]
    SchemaNotFound { service: String, location: String },

    /// The schema document exists but cannot be parsed
    #[error("Schema for service {service} is malformed: {message}")]
    SchemaParse { service: String, message: String },

    /// The discovery registry does not know the service name
    #[error("Service unknown to the registry: {service}")]
    ServiceUnknown { service: String },

    /// The service is registered but has no healthy instance
    #[error("No healthy instances for service {service}")]
    NoHealthyInstances { service: String },

    /// The discovery registry could not be queried or answered garbage
    #[error("Service resolver unavailable for {service}: {reason}")]
    ResolverUnavailable { service: String, reason: String },

    /// The schema declares no such method
    #[error("Method {method} is not declared by service {service}")]
    UnknownMethod { service: String, method: String },

    /// A field's JSON kind contradicts the schema's declared type
    #[error("Type mismatch in {service}.{method} at {field}: expected {expected}, found {found}")]
    TypeMismatch {
        service: String,
        method: String,
        field: String,
        expected: String,
        found: String,
    },

    /// Caller input is missing required fields or carries mistyped ones
    #[error("Validation failed for {service}.{method}: {}", join_issues(.issues))]
    ValidationFailed {
        service: String,
        method: String,
        issues: Vec<FieldIssue>,
    },

    /// The inbound request itself is unusable (bad route params, non-object body)
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The outbound call did not complete within its budget
    #[error("Call to {service}.{method} timed out after {timeout_ms}ms")]
    CallTimeout {
        service: String,
        method: String,
        timeout_ms: u64,
    },

    /// The caller went away while the call was in flight
    #[error("Call to {service}.{method} was cancelled")]
    Cancelled { service: String, method: String },

    /// The selected backend instance could not be reached
    #[error("Connection to {service} at {address} failed: {reason}")]
    ConnectionRefused {
        service: String,
        address: String,
        reason: String,
    },

    /// The backend reply does not honor the method's declared shape
    #[error("Malformed reply from {service}.{method}: {message}")]
    Decode {
        service: String,
        method: String,
        message: String,
    },

    /// Internal server errors for unexpected failures
    #[error("Internal server error: {message}")]
    Internal { message: String },

    /// I/O errors (file operations, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {message}")]
    Json { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// HTTP client errors when talking to the registry
    #[error("HTTP client error: {message}")]
    HttpClient { message: String },
}

impl GatewayError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error with a custom message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid_request<S: Into<String>>(reason: S) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn resolver_unavailable<S: Into<String>>(service: S, reason: S) -> Self {
        Self::ResolverUnavailable {
            service: service.into(),
            reason: reason.into(),
        }
    }

    pub fn decode<S: Into<String>>(service: S, method: S, message: S) -> Self {
        Self::Decode {
            service: service.into(),
            method: method.into(),
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::SchemaNotFound { .. } => StatusCode::NOT_FOUND,
            Self::SchemaParse { .. } => StatusCode::BAD_REQUEST,
            Self::ServiceUnknown { .. } => StatusCode::NOT_FOUND,
            Self::NoHealthyInstances { .. } => StatusCode::FAILED_DEPENDENCY,
            Self::ResolverUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownMethod { .. } => StatusCode::NOT_FOUND,
            Self::TypeMismatch { .. } => StatusCode::BAD_REQUEST,
            Self::ValidationFailed { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::CallTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled { .. } => StatusCode::REQUEST_TIMEOUT,
            Self::ConnectionRefused { .. } => StatusCode::BAD_GATEWAY,
            Self::Decode { .. } => StatusCode::BAD_GATEWAY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Json { .. } => StatusCode::BAD_REQUEST,
            Self::Yaml { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the stable reason code reported to callers
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::SchemaNotFound { .. } => "schema_not_found",
            Self::SchemaParse { .. } => "schema_parse_error",
            Self::ServiceUnknown { .. } => "service_unknown",
            Self::NoHealthyInstances { .. } => "no_healthy_instances",
            Self::ResolverUnavailable { .. } => "resolver_unavailable",
            Self::UnknownMethod { .. } => "unknown_method",
            Self::TypeMismatch { .. } => "type_mismatch",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::CallTimeout { .. } => "call_timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ConnectionRefused { .. } => "connection_refused",
            Self::Decode { .. } => "decode_error",
            Self::Internal { .. } => "internal_error",
            Self::Io { .. } => "io_error",
            Self::Json { .. } => "json_error",
            Self::Yaml { .. } => "yaml_error",
            Self::HttpClient { .. } => "http_client_error",
        }
    }

    /// Error family, used to keep decode failures apart from transport failures in logs
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration { .. }
            | Self::SchemaNotFound { .. }
            | Self::SchemaParse { .. }
            | Self::ServiceUnknown { .. }
            | Self::NoHealthyInstances { .. }
            | Self::ResolverUnavailable { .. }
            | Self::UnknownMethod { .. }
            | Self::Yaml { .. } => ErrorClass::Configuration,
            Self::TypeMismatch { .. }
            | Self::ValidationFailed { .. }
            | Self::InvalidRequest { .. }
            | Self::Json { .. } => ErrorClass::Validation,
            Self::CallTimeout { .. }
            | Self::Cancelled { .. }
            | Self::ConnectionRefused { .. }
            | Self::HttpClient { .. }
            | Self::Io { .. } => ErrorClass::Transport,
            Self::Decode { .. } => ErrorClass::Decode,
            Self::Internal { .. } => ErrorClass::Internal,
        }
    }

    /// Whether an external caller may reasonably retry the same request later.
    ///
    /// The gateway itself never retries; this is advice for the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoHealthyInstances { .. }
                | Self::ResolverUnavailable { .. }
                | Self::CallTimeout { .. }
                | Self::ConnectionRefused { .. }
                | Self::HttpClient { .. }
                | Self::Io { .. }
        )
    }
}

impl From<Infallible> for GatewayError {
    fn from(infallible: Infallible) -> Self {
        match infallible {}
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for GatewayError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::HttpClient {
            message: err.to_string(),
        }
    }
}

/// Failures become a plain-text body `<reason_code>: <message>` with the mapped status.
/// The reason code is repeated in the `x-gateway-error` header for programmatic callers.
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = format!("{}: {}", self.error_type(), self);

        let mut response = (status, body).into_response();
        response.headers_mut().insert(
            ERROR_TYPE_HEADER,
            HeaderValue::from_static(self.error_type()),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            GatewayError::ServiceUnknown {
                service: "UnknownService".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::ValidationFailed {
                service: "TravelService".to_string(),
                method: "RetrieveClientData".to_string(),
                issues: vec![FieldIssue::missing("userID")],
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::Cancelled {
                service: "a".to_string(),
                method: "b".to_string()
            }
            .status_code(),
            StatusCode::REQUEST_TIMEOUT
        );
        assert!(GatewayError::CallTimeout {
            service: "a".to_string(),
            method: "b".to_string(),
            timeout_ms: 3000
        }
        .status_code()
        .is_server_error());
    }

    #[test]
    fn test_configuration_errors_are_client_errors() {
        let errors = vec![
            GatewayError::SchemaNotFound {
                service: "s".to_string(),
                location: "./thriftFiles/s.thrift".to_string(),
            },
            GatewayError::SchemaParse {
                service: "s".to_string(),
                message: "bad".to_string(),
            },
            GatewayError::NoHealthyInstances {
                service: "s".to_string(),
            },
        ];
        for error in errors {
            assert!(error.status_code().is_client_error(), "{}", error);
            assert_eq!(error.class(), ErrorClass::Configuration);
        }
    }

    #[test]
    fn test_validation_message_names_fields() {
        let error = GatewayError::ValidationFailed {
            service: "TravelService".to_string(),
            method: "RetrieveClientData".to_string(),
            issues: vec![
                FieldIssue::missing("userID"),
                FieldIssue::wrong_type("Msg", "string", "number"),
            ],
        };
        let message = error.to_string();
        assert!(message.contains("userID (missing)"));
        assert!(message.contains("Msg (expected string, found number)"));
    }

    #[test]
    fn test_decode_is_distinct_from_transport() {
        let decode = GatewayError::decode("s", "m", "not json");
        let refused = GatewayError::ConnectionRefused {
            service: "s".to_string(),
            address: "127.0.0.1:1".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(decode.class(), ErrorClass::Decode);
        assert_eq!(refused.class(), ErrorClass::Transport);
        assert!(!decode.is_retryable());
        assert!(refused.is_retryable());
    }

    #[test]
    fn test_into_response_sets_reason_header() {
        let response = GatewayError::ServiceUnknown {
            service: "Nope".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(ERROR_TYPE_HEADER).unwrap(),
            "service_unknown"
        );
    }
}
