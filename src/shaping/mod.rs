//! Request shaping: per-method field rules applied before any network I/O.

pub mod shaper;

pub use shaper::{FieldKind, FieldRule, RequestShaper, RuleSource, ShapeRule, PASSTHROUGH_FIELD};
