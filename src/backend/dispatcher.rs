//! # Backend Generic Dispatcher
//!
//! Server-side entry point for generic calls: a method name plus a raw JSON payload go in,
//! a [`ReplyEnvelope`] comes out. Methods are looked up in a [`MethodRegistry`] that is
//! checked against the service schema at startup. Caller input never makes this panic; every
//! failure becomes a status reply.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, warn};

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ReplyEnvelope;
use crate::schema::Codec;
use crate::shaping::{FieldKind, FieldRule, RuleSource, ShapeRule};

/// Status message of replies to undeclared methods
pub const INVALID_METHOD: &str = "invalid method";
/// Status message of replies whose payload could not be decoded
pub const DECODE_ERROR: &str = "decode error";
/// Status message of replies rejected by a handler's field rule
pub const VALIDATION_FAILED: &str = "validation failed";

/// Typed method body: receives validated fields, returns the reply payload
pub type HandlerFn = fn(&Map<String, Value>) -> Map<String, Value>;

pub struct MethodHandler {
    rule: ShapeRule,
    handler: HandlerFn,
}

impl fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandler")
            .field("rule", &self.rule)
            .finish_non_exhaustive()
    }
}

/// Method name to handler table for one service
#[derive(Debug)]
pub struct MethodRegistry {
    service: String,
    handlers: HashMap<String, MethodHandler>,
}

impl MethodRegistry {
    pub fn new<S: Into<String>>(service: S) -> Self {
        Self {
            service: service.into(),
            handlers: HashMap::new(),
        }
    }

    /// Add a handler requiring `required` fields with the given kinds
    pub fn method(mut self, name: &str, required: &[(&str, FieldKind)], handler: HandlerFn) -> Self {
        let fields = required
            .iter()
            .map(|(field, kind)| FieldRule {
                name: field.to_string(),
                kind: *kind,
                required: true,
            })
            .collect();
        self.handlers.insert(
            name.to_string(),
            MethodHandler {
                rule: ShapeRule {
                    source: RuleSource::Configured,
                    fields,
                },
                handler,
            },
        );
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Every handler must implement a method the schema declares
    pub fn validate_against(&self, codec: &Codec) -> GatewayResult<()> {
        let undeclared: Vec<&str> = self
            .methods()
            .into_iter()
            .filter(|method| !codec.has_method(method))
            .collect();
        if !undeclared.is_empty() {
            return Err(GatewayError::config(format!(
                "schema for {} does not declare handled methods: {}",
                self.service,
                undeclared.join(", ")
            )));
        }

        for declared in codec.method_names() {
            if !self.contains(declared) {
                warn!(service = %self.service, method = %declared, "Declared method has no handler");
            }
        }
        Ok(())
    }
}

/// Stateless per-call dispatcher over a validated registry
#[derive(Debug)]
pub struct GenericDispatcher {
    registry: MethodRegistry,
}

impl GenericDispatcher {
    pub fn new(registry: MethodRegistry) -> Self {
        Self { registry }
    }

    /// Build a dispatcher, failing if the registry and schema disagree
    pub fn with_schema(registry: MethodRegistry, codec: &Codec) -> GatewayResult<Self> {
        registry.validate_against(codec)?;
        Ok(Self::new(registry))
    }

    pub fn service(&self) -> &str {
        self.registry.service()
    }

    /// Handle one call
    pub fn handle(&self, method: &str, payload: &str) -> ReplyEnvelope {
        let fields = match serde_json::from_str::<Value>(payload) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                return ReplyEnvelope::error(
                    400,
                    DECODE_ERROR.to_string(),
                    format!("payload must be a JSON object, got {}", crate::schema::json_kind(&other)),
                )
            }
            Err(e) => {
                return ReplyEnvelope::error(
                    400,
                    DECODE_ERROR.to_string(),
                    format!("payload is not valid JSON: {}", e),
                )
            }
        };

        let handler = match self.registry.handlers.get(method) {
            Some(handler) => handler,
            None => {
                debug!(service = %self.service(), method = %method, "Invalid method requested");
                return ReplyEnvelope::error(
                    400,
                    INVALID_METHOD.to_string(),
                    format!("Invalid method name {}", method),
                );
            }
        };

        let issues = handler.rule.check(&fields);
        if !issues.is_empty() {
            let detail = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            return ReplyEnvelope::error(400, VALIDATION_FAILED.to_string(), detail);
        }

        ReplyEnvelope::ok((handler.handler)(&fields))
    }

    /// Handle one call and serialize the reply for the wire
    pub fn handle_to_wire(&self, method: &str, payload: &str) -> String {
        self.handle(method, payload).to_json().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::codec_from_source;
    use serde_json::json;

    fn echo(fields: &Map<String, Value>) -> Map<String, Value> {
        fields.clone()
    }

    fn dispatcher() -> GenericDispatcher {
        GenericDispatcher::new(
            MethodRegistry::new("EchoService").method("Echo", &[("Msg", FieldKind::String)], echo),
        )
    }

    #[test]
    fn test_handles_known_method() {
        let reply = dispatcher().handle("Echo", r#"{"Msg":"hi"}"#);
        assert!(reply.is_success());
        assert_eq!(
            reply.to_json(),
            json!({"Msg": "hi", "BaseResp": {"StatusCode": 200, "StatusMessage": "Success"}})
        );
    }

    #[test]
    fn test_unknown_method_is_invalid_method_reply() {
        let reply = dispatcher().handle("bogus", "{}");
        assert_eq!(reply.status_code, 400);
        assert_eq!(reply.status_message, INVALID_METHOD);
    }

    #[test]
    fn test_bad_payloads_never_panic() {
        for payload in ["", "not json", "[1,2]", "null", "\"Msg\""] {
            let reply = dispatcher().handle("Echo", payload);
            assert_eq!(reply.status_code, 400);
            assert_eq!(reply.status_message, DECODE_ERROR);
        }
    }

    #[test]
    fn test_required_fields_checked() {
        let reply = dispatcher().handle("Echo", r#"{"Msg": 3}"#);
        assert_eq!(reply.status_message, VALIDATION_FAILED);
        assert_eq!(
            reply.payload["Msg"],
            json!("Msg (expected string, found integer)")
        );
    }

    #[test]
    fn test_registry_validated_against_schema() {
        let codec = codec_from_source(
            "EchoService",
            "struct R { 1: string Msg } service EchoService { R Echo(1: R r) }",
        )
        .unwrap();

        let ok = MethodRegistry::new("EchoService").method("Echo", &[], echo);
        assert!(GenericDispatcher::with_schema(ok, &codec).is_ok());

        let extra = MethodRegistry::new("EchoService")
            .method("Echo", &[], echo)
            .method("Shout", &[], echo);
        let err = GenericDispatcher::with_schema(extra, &codec).unwrap_err();
        assert!(err.to_string().contains("Shout"));
    }
}
