//! # JSON <-> Thrift-generic Codec
//!
//! A [`Codec`] binds one service declared in an IDL document and converts between loose JSON
//! and the JSON-generic wire payload of that service's methods.
//!
//! ## How it works
//!
//! 1. **Encode (JSON -> wire)**:
//!    - Looks the method up in the service (including methods inherited through `extends`).
//!    - Type-checks every declared field of the argument struct, recursively. Integers are
//!      range-checked for their width, enums accept a member name or value, `binary` accepts
//!      a string. Undeclared keys are dropped.
//!    - Serializes the checked object with sorted keys, so equal inputs give equal bytes.
//!
//! 2. **Decode (wire -> JSON)**:
//!    - Parses the reply bytes as JSON.
//!    - Checks the value against the method's declared return type. Undeclared keys are kept.
//!    - Replies whose `BaseResp` reports a failure are relayed without the shape check.

use bytes::Bytes;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ReplyEnvelope;
use crate::schema::idl::{Document, EnumDef, Field, FieldType, Function, StructDef, StructKind};

/// A named type after typedefs have been followed
#[derive(Debug, Clone, Copy)]
pub enum Resolved<'a> {
    Base(&'a FieldType),
    Struct(&'a StructDef),
    Enum(&'a EnumDef),
}

/// First field whose value contradicts the schema
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mismatch {
    field: String,
    expected: String,
    found: String,
}

impl Mismatch {
    fn new(field: &str, expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self {
            field: if field.is_empty() {
                "<root>".to_string()
            } else {
                field.to_string()
            },
            expected: expected.into(),
            found: found.into(),
        }
    }
}

/// JSON kind of a value, as used in type mismatch messages
pub fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

const MAX_EXTENDS_DEPTH: usize = 16;

/// Encoder/decoder for the methods of one service
#[derive(Debug)]
pub struct Codec {
    service: String,
    document: Document,
    methods: HashMap<String, Function>,
    method_order: Vec<String>,
}

impl Codec {
    /// Bind `service_name` in `document`.
    ///
    /// When the document declares exactly one service under another name, that service is
    /// used. Every type reference reachable from a method must resolve.
    pub fn new(service_name: &str, document: Document) -> Result<Self, String> {
        let service = match document.service(service_name) {
            Some(service) => service,
            None if document.services.len() == 1 => {
                let only = &document.services[0];
                debug!(
                    service = %service_name,
                    declared = %only.name,
                    "Schema declares a single service under another name, binding it"
                );
                only
            }
            None => {
                return Err(format!(
                    "document does not declare service {} (declares: {})",
                    service_name,
                    document
                        .services
                        .iter()
                        .map(|s| s.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }
        };

        // Parent methods first so overrides in the child win
        let mut chain = vec![service];
        let mut visited = HashSet::new();
        visited.insert(service.name.clone());
        while let Some(parent) = chain.last().and_then(|s| s.extends.clone()) {
            if chain.len() > MAX_EXTENDS_DEPTH || !visited.insert(parent.clone()) {
                return Err(format!("service inheritance cycle at {}", parent));
            }
            match document.service(&parent) {
                Some(parent_def) => chain.push(parent_def),
                // Parent lives in an include we do not follow
                None => break,
            }
        }

        let mut methods = HashMap::new();
        let mut method_order = Vec::new();
        for definition in chain.iter().rev() {
            for function in &definition.functions {
                if methods.insert(function.name.clone(), function.clone()).is_none() {
                    method_order.push(function.name.clone());
                }
            }
        }

        let codec = Self {
            service: service_name.to_string(),
            document,
            methods,
            method_order,
        };
        codec.check_references()?;
        Ok(codec)
    }

    fn check_references(&self) -> Result<(), String> {
        let mut pending: Vec<&FieldType> = Vec::new();
        for function in self.methods.values() {
            pending.extend(function.arguments.iter().map(|f| &f.ty));
            pending.extend(function.return_type.iter());
        }

        let mut seen_structs = HashSet::new();
        while let Some(ty) = pending.pop() {
            match ty {
                FieldType::List(inner) | FieldType::Set(inner) => pending.push(inner.as_ref()),
                FieldType::Map(key, value) => {
                    pending.push(key.as_ref());
                    pending.push(value.as_ref());
                }
                FieldType::Named(name) => match self.resolve(ty) {
                    Some(Resolved::Struct(def)) => {
                        if seen_structs.insert(def.name.as_str()) {
                            pending.extend(def.fields.iter().map(|f| &f.ty));
                        }
                    }
                    Some(Resolved::Base(base)) => pending.push(base),
                    Some(Resolved::Enum(_)) => {}
                    None => return Err(format!("undefined type {}", name)),
                },
                _ => {}
            }
        }
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Method names in declaration order
    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.method_order.iter().map(String::as_str)
    }

    pub fn method(&self, method: &str) -> GatewayResult<&Function> {
        self.methods
            .get(method)
            .ok_or_else(|| GatewayError::UnknownMethod {
                service: self.service.clone(),
                method: method.to_string(),
            })
    }

    /// Follow typedefs until a base type, struct or enum is reached
    pub fn resolve<'a>(&'a self, ty: &'a FieldType) -> Option<Resolved<'a>> {
        let mut current = ty;
        for _ in 0..MAX_EXTENDS_DEPTH {
            let name = match current {
                FieldType::Named(name) => name,
                other => return Some(Resolved::Base(other)),
            };
            let short = name.rsplit('.').next().unwrap_or(name);

            if let Some(def) = self.document.structs.get(name).or_else(|| self.document.structs.get(short)) {
                return Some(Resolved::Struct(def));
            }
            if let Some(def) = self.document.enums.get(name).or_else(|| self.document.enums.get(short)) {
                return Some(Resolved::Enum(def));
            }
            current = self
                .document
                .typedefs
                .get(name)
                .or_else(|| self.document.typedefs.get(short))?;
        }
        None
    }

    /// The struct a method takes as its only argument, if that is its shape
    pub fn argument_struct(&self, method: &str) -> GatewayResult<Option<&StructDef>> {
        let function = self.method(method)?;
        Ok(self.single_struct_argument(function))
    }

    fn single_struct_argument<'a>(&'a self, function: &'a Function) -> Option<&'a StructDef> {
        match function.arguments.as_slice() {
            [only] => match self.resolve(&only.ty) {
                Some(Resolved::Struct(def)) if def.kind != StructKind::Union => Some(def),
                _ => None,
            },
            _ => None,
        }
    }

    /// Fields a caller supplies for `method`: the argument struct's fields, or the arguments
    pub fn input_fields(&self, method: &str) -> GatewayResult<&[Field]> {
        let function = self.method(method)?;
        Ok(match self.single_struct_argument(function) {
            Some(def) => &def.fields,
            None => &function.arguments,
        })
    }

    /// Encode a JSON object into the wire payload of `method`
    pub fn encode(&self, method: &str, value: &Value) -> GatewayResult<Bytes> {
        let function = self.method(method)?;
        let mismatch = |m: Mismatch| GatewayError::TypeMismatch {
            service: self.service.clone(),
            method: method.to_string(),
            field: m.field,
            expected: m.expected,
            found: m.found,
        };

        let object = value
            .as_object()
            .ok_or_else(|| mismatch(Mismatch::new("", "object", json_kind(value))))?;

        let wire = match self.single_struct_argument(function) {
            Some(def) => self.check_struct(def, object, "").map_err(mismatch)?,
            None => self
                .check_fields(&function.arguments, object, "")
                .map_err(mismatch)?,
        };

        let bytes = serde_json::to_vec(&canonical(Value::Object(wire)))?;
        Ok(Bytes::from(bytes))
    }

    /// Decode the wire reply of `method` into JSON
    pub fn decode(&self, method: &str, payload: &[u8]) -> GatewayResult<Value> {
        let function = self.method(method)?;
        let decode_error = |message: String| GatewayError::Decode {
            service: self.service.clone(),
            method: method.to_string(),
            message,
        };

        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| decode_error(format!("reply is not valid JSON: {}", e)))?;

        if let Some(reply) = ReplyEnvelope::from_json(&value) {
            if !reply.is_success() {
                return Ok(value);
            }
        }

        if let Some(return_type) = &function.return_type {
            self.check(return_type, &value, "").map_err(|m| {
                decode_error(format!(
                    "field {}: expected {}, found {}",
                    m.field, m.expected, m.found
                ))
            })?;
        }

        Ok(value)
    }

    fn check_struct(
        &self,
        def: &StructDef,
        object: &Map<String, Value>,
        path: &str,
    ) -> Result<Map<String, Value>, Mismatch> {
        let checked = self.check_fields(&def.fields, object, path)?;
        if def.kind == StructKind::Union && checked.len() > 1 {
            return Err(Mismatch::new(
                path,
                format!("union {} with one field set", def.name),
                format!("{} fields", checked.len()),
            ));
        }
        Ok(checked)
    }

    fn check_fields(
        &self,
        fields: &[Field],
        object: &Map<String, Value>,
        path: &str,
    ) -> Result<Map<String, Value>, Mismatch> {
        let mut checked = Map::new();
        for field in fields {
            let field_path = child_path(path, &field.name);
            match object.get(&field.name) {
                Some(value) if !value.is_null() => {
                    checked.insert(field.name.clone(), self.check(&field.ty, value, &field_path)?);
                }
                _ if field.is_required() => {
                    return Err(Mismatch::new(&field_path, field.ty.to_string(), "missing"));
                }
                _ => {}
            }
        }
        Ok(checked)
    }

    fn check(&self, ty: &FieldType, value: &Value, path: &str) -> Result<Value, Mismatch> {
        let resolved = self
            .resolve(ty)
            .ok_or_else(|| Mismatch::new(path, ty.to_string(), "undefined type"))?;

        match resolved {
            Resolved::Struct(def) => match value {
                Value::Object(object) => Ok(Value::Object(self.check_struct(def, object, path)?)),
                other => Err(Mismatch::new(path, def.name.clone(), json_kind(other))),
            },
            Resolved::Enum(def) => check_enum(def, value, path),
            Resolved::Base(base) => match base {
                FieldType::Bool => match value {
                    Value::Bool(_) => Ok(value.clone()),
                    other => Err(Mismatch::new(path, "bool", json_kind(other))),
                },
                FieldType::Byte => check_integer(value, path, "byte", i8::MIN as i64, i8::MAX as i64),
                FieldType::I16 => check_integer(value, path, "i16", i16::MIN as i64, i16::MAX as i64),
                FieldType::I32 => check_integer(value, path, "i32", i32::MIN as i64, i32::MAX as i64),
                FieldType::I64 => check_integer(value, path, "i64", i64::MIN, i64::MAX),
                FieldType::Double => match value {
                    Value::Number(_) => Ok(value.clone()),
                    other => Err(Mismatch::new(path, "double", json_kind(other))),
                },
                FieldType::String | FieldType::Binary => match value {
                    Value::String(_) => Ok(value.clone()),
                    other => Err(Mismatch::new(path, base.to_string(), json_kind(other))),
                },
                FieldType::List(inner) | FieldType::Set(inner) => match value {
                    Value::Array(items) => items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| self.check(inner, item, &format!("{}[{}]", path, i)))
                        .collect::<Result<Vec<_>, _>>()
                        .map(Value::Array),
                    other => Err(Mismatch::new(path, base.to_string(), json_kind(other))),
                },
                FieldType::Map(key_type, value_type) => match value {
                    Value::Object(entries) => {
                        let integer_keys = matches!(
                            self.resolve(key_type),
                            Some(Resolved::Base(
                                FieldType::Byte | FieldType::I16 | FieldType::I32 | FieldType::I64
                            ))
                        );
                        let mut checked = Map::new();
                        for (key, entry) in entries {
                            let entry_path = child_path(path, key);
                            if integer_keys && key.parse::<i64>().is_err() {
                                return Err(Mismatch::new(
                                    &entry_path,
                                    format!("{} key", key_type),
                                    "string",
                                ));
                            }
                            checked.insert(key.clone(), self.check(value_type, entry, &entry_path)?);
                        }
                        Ok(Value::Object(checked))
                    }
                    other => Err(Mismatch::new(path, base.to_string(), json_kind(other))),
                },
                FieldType::Named(name) => Err(Mismatch::new(path, name.clone(), "undefined type")),
            },
        }
    }
}

/// Recursively sort object keys
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, entry)| (key, canonical(entry)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

fn check_integer(value: &Value, path: &str, name: &str, min: i64, max: i64) -> Result<Value, Mismatch> {
    match value.as_i64() {
        Some(n) if (min..=max).contains(&n) => Ok(value.clone()),
        Some(n) => Err(Mismatch::new(path, name, format!("{} (out of range)", n))),
        None => Err(Mismatch::new(path, name, json_kind(value))),
    }
}

fn check_enum(def: &EnumDef, value: &Value, path: &str) -> Result<Value, Mismatch> {
    let expected = || format!("enum {}", def.name);
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(v) if def.contains_value(v) => Ok(Value::from(v)),
            _ => Err(Mismatch::new(path, expected(), format!("unknown value {}", n))),
        },
        Value::String(name) => def
            .value_of(name)
            .map(Value::from)
            .ok_or_else(|| Mismatch::new(path, expected(), format!("unknown member {}", name))),
        other => Err(Mismatch::new(path, expected(), json_kind(other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::idl::parse;
    use serde_json::json;

    const SCHEMA: &str = r#"
struct BaseResp {
    1: required i32 StatusCode,
    2: string StatusMessage,
}

enum Rating { POOR = 1, GOOD = 2, GREAT = 3 }

typedef i64 UserId

struct Address { 1: required string city, 2: optional string zip }

struct ProfileRequest {
    1: required UserId userID,
    2: optional list<string> tags,
    3: optional Rating rating,
    4: optional i16 age,
    5: optional Address address,
    6: optional map<i32, string> notes,
    7: optional binary avatar,
}

struct ProfileResponse {
    1: string Name,
    255: required BaseResp BaseResp,
}

service BaseService {
    void Ping()
}

service ProfileService extends BaseService {
    ProfileResponse GetProfile(1: ProfileRequest req)
    i32 Add(1: i32 a, 2: i32 b)
}
"#;

    fn codec() -> Codec {
        Codec::new("ProfileService", parse(SCHEMA).unwrap()).unwrap()
    }

    fn mismatch_field(err: GatewayError) -> String {
        match err {
            GatewayError::TypeMismatch { field, .. } => field,
            other => panic!("expected type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_methods_include_inherited() {
        let codec = codec();
        assert!(codec.has_method("GetProfile"));
        assert!(codec.has_method("Ping"));
        assert!(!codec.has_method("Nope"));
        assert_eq!(
            codec.method_names().collect::<Vec<_>>(),
            vec!["Ping", "GetProfile", "Add"]
        );
    }

    #[test]
    fn test_encode_drops_undeclared_and_sorts_keys() {
        let codec = codec();
        let bytes = codec
            .encode(
                "GetProfile",
                &json!({"userID": 7, "extra": true, "rating": "GOOD", "tags": ["a"]}),
            )
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"rating":2,"tags":["a"],"userID":7}"#
        );
    }

    #[test]
    fn test_encode_type_mismatches() {
        let codec = codec();
        let err = codec
            .encode("GetProfile", &json!({"userID": "seven"}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "userID");

        let err = codec
            .encode("GetProfile", &json!({"userID": 1, "age": 70000}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "age");

        let err = codec
            .encode("GetProfile", &json!({"userID": 1, "tags": ["ok", 3]}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "tags[1]");

        let err = codec
            .encode("GetProfile", &json!({"userID": 1, "address": {"zip": "1"}}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "address.city");

        let err = codec
            .encode("GetProfile", &json!({"userID": 1, "notes": {"x": "n"}}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "notes.x");

        let err = codec
            .encode("GetProfile", &json!({"userID": 1, "rating": "AMAZING"}))
            .unwrap_err();
        assert_eq!(mismatch_field(err), "rating");

        let err = codec.encode("GetProfile", &json!([1])).unwrap_err();
        assert_eq!(mismatch_field(err), "<root>");
    }

    #[test]
    fn test_encode_accepts_binary_string_and_null_optional() {
        let codec = codec();
        let bytes = codec
            .encode(
                "GetProfile",
                &json!({"userID": 1, "avatar": "aGVsbG8=", "age": null}),
            )
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"userID": 1, "avatar": "aGVsbG8="}));
    }

    #[test]
    fn test_encode_multiple_arguments_by_name() {
        let codec = codec();
        let bytes = codec.encode("Add", &json!({"a": 1, "b": 2})).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_unknown_method() {
        let err = codec().encode("Nope", &json!({})).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownMethod { .. }));
        let err = codec().decode("Nope", b"{}").unwrap_err();
        assert!(matches!(err, GatewayError::UnknownMethod { .. }));
    }

    #[test]
    fn test_decode_retains_undeclared_keys() {
        let reply = br#"{"Name":"Ryan","Extra":1,"BaseResp":{"StatusCode":200,"StatusMessage":"Success"}}"#;
        let value = codec().decode("GetProfile", reply).unwrap();
        assert_eq!(value["Extra"], json!(1));
        assert_eq!(value["Name"], json!("Ryan"));
    }

    #[test]
    fn test_decode_rejects_contract_violations() {
        let codec = codec();
        assert!(matches!(
            codec.decode("GetProfile", b"not json").unwrap_err(),
            GatewayError::Decode { .. }
        ));
        assert!(matches!(
            codec.decode("GetProfile", br#"{"Name": "Ryan"}"#).unwrap_err(),
            GatewayError::Decode { .. }
        ));
        assert!(matches!(
            codec
                .decode(
                    "GetProfile",
                    br#"{"Name": 5, "BaseResp": {"StatusCode": 200}}"#
                )
                .unwrap_err(),
            GatewayError::Decode { .. }
        ));
    }

    #[test]
    fn test_decode_relays_failed_replies() {
        let reply = br#"{"Msg":"invalid method","BaseResp":{"StatusCode":400,"StatusMessage":"invalid method"}}"#;
        let value = codec().decode("GetProfile", reply).unwrap();
        assert_eq!(value["Msg"], json!("invalid method"));
    }

    #[test]
    fn test_input_fields() {
        let codec = codec();
        let fields = codec.input_fields("GetProfile").unwrap();
        assert_eq!(fields[0].name, "userID");
        assert!(fields[0].is_required());
        let fields = codec.input_fields("Add").unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[test]
    fn test_binding_errors() {
        let err = Codec::new("Missing", parse(SCHEMA).unwrap()).unwrap_err();
        assert!(err.contains("does not declare service Missing"));

        let err = Codec::new(
            "S",
            parse("service S { Missing Get(1: Unknown req) }").unwrap(),
        )
        .unwrap_err();
        assert!(err.contains("undefined type"));
    }

    #[test]
    fn test_single_service_bound_under_requested_name() {
        let codec = Codec::new("Hello", parse("service Other { void Ping() }").unwrap()).unwrap();
        assert_eq!(codec.service_name(), "Hello");
        assert!(codec.has_method("Ping"));
    }
}
