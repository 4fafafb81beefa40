//! Per-method request validation.
//!
//! A [`ShapeRule`] lists the fields a method accepts with their expected JSON kind. Rules come
//! from configuration first, then from the schema's argument struct, and finally fall back to a
//! passthrough rule that forwards the caller's `data` field untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::core::config::{FieldSpec, ShapingConfig};
use crate::core::error::{FieldIssue, GatewayError, GatewayResult};
use crate::schema::{json_kind, Codec, FieldType, Resolved};

/// Field carried by the passthrough rule
pub const PASSTHROUGH_FIELD: &str = "data";

/// JSON kind a field is expected to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    /// Any JSON number, integers included
    Number,
    Bool,
    Object,
    Array,
    Any,
}

impl FieldKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }

    /// JSON kind a schema type is written as. Enums accept both names and values.
    pub fn from_schema(codec: &Codec, ty: &FieldType) -> Self {
        match codec.resolve(ty) {
            Some(Resolved::Base(base)) => match base {
                FieldType::Bool => FieldKind::Bool,
                FieldType::Byte | FieldType::I16 | FieldType::I32 | FieldType::I64 => {
                    FieldKind::Integer
                }
                FieldType::Double => FieldKind::Number,
                FieldType::String | FieldType::Binary => FieldKind::String,
                FieldType::List(_) | FieldType::Set(_) => FieldKind::Array,
                FieldType::Map(_, _) => FieldKind::Object,
                FieldType::Named(_) => FieldKind::Any,
            },
            Some(Resolved::Struct(_)) => FieldKind::Object,
            Some(Resolved::Enum(_)) | None => FieldKind::Any,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
}

/// Where a rule was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSource {
    Configured,
    Schema,
    Passthrough,
}

/// Fields of one method, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeRule {
    pub source: RuleSource,
    pub fields: Vec<FieldRule>,
}

impl ShapeRule {
    fn from_specs(required: &[FieldSpec], optional: &[FieldSpec]) -> Self {
        let rule = |spec: &FieldSpec, required: bool| FieldRule {
            name: spec.name.clone(),
            kind: spec.kind,
            required,
        };
        Self {
            source: RuleSource::Configured,
            fields: required
                .iter()
                .map(|spec| rule(spec, true))
                .chain(optional.iter().map(|spec| rule(spec, false)))
                .collect(),
        }
    }

    /// Rule derived from the fields the schema declares for `method`
    pub fn from_schema(codec: &Codec, method: &str) -> GatewayResult<Self> {
        let fields = codec
            .input_fields(method)?
            .iter()
            .map(|field| FieldRule {
                name: field.name.clone(),
                kind: FieldKind::from_schema(codec, &field.ty),
                required: field.is_required(),
            })
            .collect();
        Ok(Self {
            source: RuleSource::Schema,
            fields,
        })
    }

    pub fn passthrough() -> Self {
        Self {
            source: RuleSource::Passthrough,
            fields: Vec::new(),
        }
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|field| field.required)
            .map(|field| field.name.as_str())
    }

    /// Every missing required field and every mistyped present field, in rule order
    pub fn check(&self, fields: &Map<String, Value>) -> Vec<FieldIssue> {
        let mut issues = Vec::new();
        for rule in &self.fields {
            match fields.get(&rule.name) {
                None | Some(Value::Null) if rule.required => {
                    issues.push(FieldIssue::missing(rule.name.as_str()));
                }
                None | Some(Value::Null) => {}
                Some(value) if !rule.kind.matches(value) => {
                    issues.push(FieldIssue::wrong_type(
                        rule.name.as_str(),
                        rule.kind.as_str(),
                        json_kind(value),
                    ));
                }
                Some(_) => {}
            }
        }
        issues
    }
}

/// Validates and shapes inbound field maps into method payloads
#[derive(Debug, Clone, Default)]
pub struct RequestShaper {
    configured: HashMap<(String, String), ShapeRule>,
}

impl RequestShaper {
    pub fn new(config: &ShapingConfig) -> Self {
        let configured = config
            .rules
            .iter()
            .map(|rule| {
                (
                    (rule.service.clone(), rule.method.clone()),
                    ShapeRule::from_specs(&rule.required, &rule.optional),
                )
            })
            .collect();
        Self { configured }
    }

    /// Rule governing `service.method`
    pub fn rule_for(&self, service: &str, method: &str, codec: Option<&Codec>) -> ShapeRule {
        if let Some(rule) = self
            .configured
            .get(&(service.to_string(), method.to_string()))
        {
            return rule.clone();
        }

        match codec.map(|codec| ShapeRule::from_schema(codec, method)) {
            Some(Ok(rule)) => rule,
            _ => ShapeRule::passthrough(),
        }
    }

    /// Validate `fields` and build the payload handed to the codec
    pub fn shape(
        &self,
        service: &str,
        method: &str,
        fields: &Map<String, Value>,
        codec: Option<&Codec>,
    ) -> GatewayResult<Value> {
        let rule = self.rule_for(service, method, codec);

        if rule.source == RuleSource::Passthrough {
            let data = fields.get(PASSTHROUGH_FIELD).cloned().unwrap_or(Value::Null);
            let mut payload = Map::new();
            payload.insert(PASSTHROUGH_FIELD.to_string(), data);
            return Ok(Value::Object(payload));
        }

        let issues = rule.check(fields);
        if !issues.is_empty() {
            debug!(
                service = %service,
                method = %method,
                issues = issues.len(),
                "Request rejected by shape rule"
            );
            metrics::counter!("shaping_rejections_total").increment(1);
            return Err(GatewayError::ValidationFailed {
                service: service.to_string(),
                method: method.to_string(),
                issues,
            });
        }

        Ok(Value::Object(fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ShapeRuleConfig;
    use crate::core::error::FieldProblem;
    use crate::schema::codec_from_source;
    use serde_json::json;

    const SCHEMA: &str = r#"
        struct RetrieveClientDataRequest {
            1: required i64 userID
            2: optional string note
        }
        struct Reply { 1: string Name }
        service TravelService {
            Reply RetrieveClientData(1: RetrieveClientDataRequest req)
        }
    "#;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_schema_rule_reports_missing_field() {
        let codec = codec_from_source("TravelService", SCHEMA).unwrap();
        let shaper = RequestShaper::default();

        let err = shaper
            .shape("TravelService", "RetrieveClientData", &Map::new(), Some(&codec))
            .unwrap_err();
        match err {
            GatewayError::ValidationFailed { issues, .. } => {
                assert_eq!(issues, vec![FieldIssue::missing("userID")]);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_null_counts_as_missing_and_extras_ignored() {
        let codec = codec_from_source("TravelService", SCHEMA).unwrap();
        let shaper = RequestShaper::default();

        let input = fields(json!({"userID": null, "extra": true}));
        let err = shaper
            .shape("TravelService", "RetrieveClientData", &input, Some(&codec))
            .unwrap_err();
        assert!(err.to_string().contains("userID (missing)"));
        assert!(!err.to_string().contains("extra"));

        let input = fields(json!({"userID": 42, "extra": true}));
        let payload = shaper
            .shape("TravelService", "RetrieveClientData", &input, Some(&codec))
            .unwrap();
        assert_eq!(payload["userID"], json!(42));
    }

    #[test]
    fn test_reports_every_issue_in_order_and_is_repeatable() {
        let codec = codec_from_source("TravelService", SCHEMA).unwrap();
        let shaper = RequestShaper::default();
        let input = fields(json!({"userID": "42", "note": 7}));

        let first = shaper
            .shape("TravelService", "RetrieveClientData", &input, Some(&codec))
            .unwrap_err();
        let second = shaper
            .shape("TravelService", "RetrieveClientData", &input, Some(&codec))
            .unwrap_err();
        assert_eq!(first.to_string(), second.to_string());

        match first {
            GatewayError::ValidationFailed { issues, .. } => {
                assert_eq!(issues.len(), 2);
                assert_eq!(issues[0].field, "userID");
                assert_eq!(
                    issues[0].problem,
                    FieldProblem::WrongType {
                        expected: "integer".to_string(),
                        found: "string".to_string()
                    }
                );
                assert_eq!(issues[1].field, "note");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_configured_rule_takes_precedence() {
        let codec = codec_from_source("TravelService", SCHEMA).unwrap();
        let shaper = RequestShaper::new(&ShapingConfig {
            rules: vec![ShapeRuleConfig {
                service: "TravelService".to_string(),
                method: "RetrieveClientData".to_string(),
                required: vec![FieldSpec {
                    name: "token".to_string(),
                    kind: FieldKind::String,
                }],
                optional: vec![],
            }],
        });

        let rule = shaper.rule_for("TravelService", "RetrieveClientData", Some(&codec));
        assert_eq!(rule.source, RuleSource::Configured);
        assert_eq!(rule.required_fields().collect::<Vec<_>>(), vec!["token"]);

        let input = fields(json!({"userID": 1}));
        assert!(shaper
            .shape("TravelService", "RetrieveClientData", &input, Some(&codec))
            .is_err());
    }

    #[test]
    fn test_passthrough_wraps_data() {
        let shaper = RequestShaper::default();
        let input = fields(json!({"data": {"a": [1, 2]}, "other": 1}));
        let payload = shaper.shape("Anything", "Echo", &input, None).unwrap();
        assert_eq!(payload, json!({"data": {"a": [1, 2]}}));

        let payload = shaper.shape("Anything", "Echo", &Map::new(), None).unwrap();
        assert_eq!(payload, json!({"data": null}));
    }

    #[test]
    fn test_kind_matching() {
        assert!(FieldKind::Number.matches(&json!(1)));
        assert!(FieldKind::Number.matches(&json!(1.5)));
        assert!(!FieldKind::Integer.matches(&json!(1.5)));
        assert!(FieldKind::Any.matches(&json!(null)));
        assert!(!FieldKind::Bool.matches(&json!("true")));
    }
}
