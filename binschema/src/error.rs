//! Error taxonomy for the schema model, planner, and emitter.
//!
//! The bit stream runtime has its own error types in [`crate::bitstream`]
//! (`EncodeError`/`DecodeError`) since those are raised by *generated* code
//! at encode/decode time, not by this crate while it is generating source.

use thiserror::Error;

/// Static errors raised while parsing a schema from YAML.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid schema version `{0}` (expected `1.0`)")]
    InvalidVersion(String),
    #[error("YAML parsing error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("type name `{0}` must start with an uppercase letter")]
    InvalidTypeName(String),
}

/// Static errors raised while planning — unknown types, bad
/// alignment, malformed computed-field targets, dangling `terminal_variants`.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("type `{referrer}` references unknown type `{target}`")]
    UnknownType { referrer: String, target: String },
    #[error("instance field `{field}` on `{type_name}` has non-power-of-two alignment {align}")]
    InvalidAlignment {
        type_name: String,
        field: String,
        align: u64,
    },
    #[error("field `{field}` on `{type_name}` has a malformed computed target: {reason}")]
    MalformedComputedTarget {
        type_name: String,
        field: String,
        reason: String,
    },
    #[error("`terminal_variants` on `{type_name}.{field}` names undeclared variant `{variant}`")]
    UnknownTerminalVariant {
        type_name: String,
        field: String,
        variant: String,
    },
    #[error("template `{0}` could not be instantiated: {1}")]
    TemplateInstantiation(String, String),
    #[error("`corresponding<{0}>` selector used on `{1}.{2}` outside of an array context")]
    CorrespondingOutsideArray(String, String, String),
}

/// Aggregated planning failure: every [`PlanError`] found in one pass, so a
/// caller sees all actionable problems instead of stopping at the first.
#[derive(Error, Debug)]
#[error("{} planning error(s):\n{}", .0.len(), render_plan_errors(.0))]
pub struct PlanErrors(pub Vec<PlanError>);

fn render_plan_errors(errors: &[PlanError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Failures raised by generated code while evaluating a lazy instance
/// (position) field.
#[derive(Error, Debug)]
pub enum LazyEvalError {
    #[error("circular lazy reference while evaluating instance field `{0}`")]
    Circular(String),
    #[error("instance field `{field}` position reference `{target}` could not be resolved")]
    UnresolvedPosition { field: String, target: String },
}
