//! Schema-driven payload translation: IDL parsing, the per-service codec and schema loading.

pub mod codec;
pub mod idl;
pub mod provider;

pub use codec::{json_kind, Codec, Resolved};
pub use idl::{Document, Field, FieldType, Function, ParseError, Requiredness, StructDef};
pub use provider::{codec_from_source, validate_service_name, SchemaProvider, ThriftFileProvider};
