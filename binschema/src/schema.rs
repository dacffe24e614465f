//! # Schema Model
//!
//! The canonical, read-only, in-memory description of a single binary wire
//! format: a [`Schema`] is a mapping from type name to [`TypeDef`], each
//! either a [`Composite`] (an ordered field list, plus optional lazy
//! [`Instance`] fields) or a direct [`Descriptor`] alias.
//!
//! ## Schema Format
//!
//! Schemas are authored as YAML and loaded with [`Schema::from_yaml`] /
//! [`Schema::load_from_file`]. The vocabulary of [`Descriptor`] kinds is
//! closed — see the module-level enums below — and mirrors the wire types a
//! generated encoder/decoder pair must realize.
//!
//! ## Public API
//!
//! - [`Schema::get_fields`]: ordered field list of a composite (empty for an
//!   alias).
//! - [`Schema::is_alias`]: true iff a [`TypeDef`] has no field sequence.
//! - [`Schema::resolve_template`]: materializes `Name<T>` by substituting
//!   `T` in the template's descriptors.
//! - [`sanitize_ident`]: deterministic, idempotent reserved-word escaping.

use std::{collections::HashMap, fs, path::Path};

use indexmap::IndexMap;
use serde::Deserialize;
use serde_aux::field_attributes::deserialize_number_from_string;

use crate::error::SchemaError;

// ---------------------------------------------------------------------
// Top-level schema
// ---------------------------------------------------------------------

/// A fully parsed schema: global config plus the named type table.
///
/// Construction is the only mutation point; a [`Schema`] is immutable for
/// the lifetime of one generator invocation.
#[derive(Debug, Clone, Deserialize)]
pub struct Schema {
    pub version: String,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub config: GlobalConfig,
    pub types: IndexMap<String, TypeDef>,
}

/// Optional protocol metadata, purely descriptive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Global defaults a schema can override per-field.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    #[serde(default)]
    pub default_endianness: Endianness,
    #[serde(default)]
    pub default_bit_order: BitOrder,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            default_endianness: Endianness::Big,
            default_bit_order: BitOrder::Msb,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BitOrder {
    #[default]
    Msb,
    Lsb,
}

impl Schema {
    /// Parses a schema from a YAML string, rejecting anything but version
    /// `1.0`.
    pub fn from_yaml(yaml: &str) -> Result<Self, SchemaError> {
        let schema: Schema = serde_yaml::from_str(yaml)?;
        if schema.version != "1.0" {
            return Err(SchemaError::InvalidVersion(schema.version.clone()));
        }
        crate::diag::debug!(
            "loaded schema `{}` with {} declared type(s)",
            schema.metadata.name,
            schema.types.len()
        );
        for name in schema.types.keys() {
            if !name
                .chars()
                .next()
                .map(|c| c.is_ascii_uppercase())
                .unwrap_or(false)
            {
                // Template names like `Optional<T>` still start with an
                // uppercase letter; only the base identifier is checked.
                let base = name.split('<').next().unwrap_or(name);
                if !base
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_uppercase())
                    .unwrap_or(false)
                {
                    return Err(SchemaError::InvalidTypeName(name.clone()));
                }
            }
        }
        Ok(schema)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, SchemaError> {
        let text = fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    /// True iff `name` names a parameterized template (`Name<T>`), which is
    /// skipped by top-level emission and only materialized on use.
    pub fn is_template(name: &str) -> bool {
        name.contains('<')
    }

    /// Ordered field list of a composite; empty for an alias.
    pub fn get_fields<'a>(&'a self, type_def: &'a TypeDef) -> &'a [Field] {
        match type_def {
            TypeDef::Composite(c) => &c.fields,
            TypeDef::Alias(_) => &[],
        }
    }

    /// A [`TypeDef`] is an alias iff it has no ordered field sequence *and*
    /// is not a standalone array/string, both of which still need their own
    /// emitted encoder/decoder pair.
    pub fn is_alias(type_def: &TypeDef) -> bool {
        match type_def {
            TypeDef::Composite(_) => false,
            TypeDef::Alias(d) => !matches!(d, Descriptor::Array(_) | Descriptor::String(_)),
        }
    }

    /// Resolves a (possibly parameterized) type reference. For a plain name
    /// this is a direct table lookup; for `G<X>` it looks up the template
    /// `G<T>` and returns a materialized copy with the literal `T`
    /// substituted by `X` throughout the template's descriptors.
    pub fn resolve_template(&self, name: &str) -> Result<TypeDef, SchemaError> {
        if let Some(def) = self.types.get(name) {
            return Ok(def.clone());
        }
        let (base, arg) = parse_template_ref(name)
            .ok_or_else(|| SchemaError::InvalidTypeName(name.to_string()))?;
        let template_name = format!("{base}<T>");
        let template = self.types.get(&template_name).ok_or_else(|| {
            SchemaError::InvalidTypeName(format!(
                "template `{template_name}` not found for reference `{name}`"
            ))
        })?;
        crate::diag::debug!("instantiating template `{template_name}` as `{name}`");
        Ok(substitute_template_param(template, &arg))
    }
}

fn parse_template_ref(name: &str) -> Option<(String, String)> {
    let open = name.find('<')?;
    let close = name.rfind('>')?;
    if close < open {
        return None;
    }
    Some((
        name[..open].to_string(),
        name[open + 1..close].to_string(),
    ))
}

/// Substitutes every occurrence of the bare literal type-parameter name `T`
/// (as a type-reference name) with `arg` throughout a template's
/// descriptors. This is deliberately string/name substitution, not a
/// general AST rewrite — a tractable special case only so long as templates
/// take exactly one parameter.
fn substitute_template_param(template: &TypeDef, arg: &str) -> TypeDef {
    fn subst_descriptor(d: &Descriptor, arg: &str) -> Descriptor {
        match d {
            Descriptor::TypeRef(r) if r.name == "T" && r.type_args.is_empty() => {
                Descriptor::TypeRef(TypeRefDescriptor {
                    name: arg.to_string(),
                    type_args: vec![],
                })
            }
            Descriptor::Array(a) => Descriptor::Array(ArrayDescriptor {
                kind: a.kind.clone(),
                items: Box::new(subst_descriptor(&a.items, arg)),
            }),
            Descriptor::Optional(o) => Descriptor::Optional(OptionalDescriptor {
                value_type: Box::new(subst_descriptor(&o.value_type, arg)),
                presence_type: o.presence_type,
            }),
            other => other.clone(),
        }
    }
    match template {
        TypeDef::Alias(d) => TypeDef::Alias(subst_descriptor(d, arg)),
        TypeDef::Composite(c) => TypeDef::Composite(Composite {
            description: c.description.clone(),
            fields: c
                .fields
                .iter()
                .map(|f| Field {
                    descriptor: subst_descriptor(&f.descriptor, arg),
                    ..f.clone()
                })
                .collect(),
            instances: c.instances.clone(),
        }),
    }
}

// ---------------------------------------------------------------------
// Type definitions
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TypeDef {
    Composite(Composite),
    Alias(Descriptor),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Composite {
    pub fields: Vec<Field>,
    #[serde(default)]
    pub instances: Vec<Instance>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(flatten)]
    pub descriptor: Descriptor,
    #[serde(default)]
    pub conditional: Option<String>,
    #[serde(default)]
    pub computed: Option<ComputedSpec>,
    #[serde(default)]
    pub endianness: Option<Endianness>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Lazy, seek-based position field.
#[derive(Debug, Clone, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub position: PositionExpr,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub align: Option<u64>,
}

/// Where an instance field's bytes live, before it is resolved at runtime.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PositionExpr {
    /// Absolute byte offset, or (if negative) EOF-relative: `bufferLength +
    /// offset`.
    Absolute(i64),
    /// A field-reference path, resolved against the same composite or
    /// `_root.`.
    FieldRef(String),
}

// ---------------------------------------------------------------------
// Descriptor vocabulary (the closed kind set)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Bit {
        size: u8,
    },
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Bitfield(BitfieldDescriptor),
    Array(ArrayDescriptor),
    String(StringDescriptor),
    DiscriminatedUnion(DiscriminatedUnionDescriptor),
    Choice(ChoiceDescriptor),
    BackReference(BackRefSpec),
    Optional(OptionalDescriptor),
    /// A reference to another declared type, possibly parameterized
    /// (`type: "Optional<Header>"`).
    TypeRef(TypeRefDescriptor),
}

impl Descriptor {
    /// True for the nine primitive scalar kinds.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Descriptor::Bit { .. }
                | Descriptor::Uint8
                | Descriptor::Uint16
                | Descriptor::Uint32
                | Descriptor::Uint64
                | Descriptor::Int8
                | Descriptor::Int16
                | Descriptor::Int32
                | Descriptor::Int64
                | Descriptor::Float32
                | Descriptor::Float64
        )
    }

    /// Static bit width, when known without a value in hand (primitives,
    /// bitfields, fixed-size arrays of such).
    pub fn static_bit_width(&self) -> Option<u64> {
        match self {
            Descriptor::Bit { size } => Some(*size as u64),
            Descriptor::Uint8 | Descriptor::Int8 => Some(8),
            Descriptor::Uint16 | Descriptor::Int16 => Some(16),
            Descriptor::Uint32 | Descriptor::Int32 | Descriptor::Float32 => Some(32),
            Descriptor::Uint64 | Descriptor::Int64 | Descriptor::Float64 => Some(64),
            Descriptor::Bitfield(b) => Some(b.total_size as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeRefDescriptor {
    pub name: String,
    #[serde(default)]
    pub type_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitfieldDescriptor {
    pub total_size: u32,
    pub fields: Vec<BitfieldSubfield>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitfieldSubfield {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArrayDescriptor {
    #[serde(flatten)]
    pub kind: ArrayKind,
    pub items: Box<Descriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "array_kind", rename_all = "snake_case")]
pub enum ArrayKind {
    Fixed {
        length: u64,
    },
    LengthPrefixed {
        length_type: PrimitiveWidth,
    },
    LengthPrefixedItems {
        length_type: PrimitiveWidth,
        item_length_type: PrimitiveWidth,
    },
    FieldReferenced {
        length_field: String,
    },
    NullTerminated {
        #[serde(default)]
        terminal_variants: Option<Vec<String>>,
    },
    SignatureTerminated {
        #[serde(deserialize_with = "deserialize_number_from_string")]
        terminator_value: u64,
        terminator_type: PrimitiveWidth,
        #[serde(default)]
        endianness: Option<Endianness>,
    },
    EofTerminated,
}

/// Fixed-width integer kinds usable in length/terminator positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveWidth {
    Uint8,
    Uint16,
    Uint32,
    Uint64,
}

impl PrimitiveWidth {
    pub fn bits(self) -> u32 {
        match self {
            PrimitiveWidth::Uint8 => 8,
            PrimitiveWidth::Uint16 => 16,
            PrimitiveWidth::Uint32 => 32,
            PrimitiveWidth::Uint64 => 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StringDescriptor {
    #[serde(flatten)]
    pub kind: ArrayKind,
    pub encoding: StringEncoding,
    /// Present only for `fixed`-kind strings; canonicalized into
    /// `field_referenced` by [`StringDescriptor::canonicalize`] when set.
    #[serde(default)]
    pub length_field: Option<String>,
}

impl StringDescriptor {
    pub fn canonicalize(mut self) -> Self {
        if let (ArrayKind::Fixed { .. }, Some(field)) = (&self.kind, self.length_field.take()) {
            self.kind = ArrayKind::FieldReferenced {
                length_field: field,
            };
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    Ascii,
    Utf8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscriminatedUnionDescriptor {
    pub discriminator: DiscriminatorSpec,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DiscriminatorSpec {
    /// Peeked from the wire without consuming it.
    Peek {
        width: PrimitiveWidth,
        #[serde(default)]
        endianness: Option<Endianness>,
    },
    /// Taken from an already-decoded sibling field.
    Field { field_name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    /// Predicate in the conditional expression dialect ([`crate::expr`]);
    /// absent on exactly one variant, the fallback.
    #[serde(default)]
    pub when: Option<String>,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceDescriptor {
    pub choices: Vec<ChoiceVariant>,
    /// Explicit discriminator width: when present each choice's `tag` (or
    /// its 1-based declaration index) is matched against a value of this
    /// width read from the first bytes of the variant. When absent, a
    /// fallback applies: sequential bytes `0x01, 0x02, …` are assumed.
    #[serde(default)]
    pub discriminant_type: Option<PrimitiveWidth>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChoiceVariant {
    pub target: String,
    #[serde(default)]
    pub tag: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageWidth {
    Uint8,
    Uint16,
    Uint32,
}

impl StorageWidth {
    pub fn bits(self) -> u32 {
        match self {
            StorageWidth::Uint8 => 8,
            StorageWidth::Uint16 => 16,
            StorageWidth::Uint32 => 32,
        }
    }

    /// The discriminator bits set on a pointer word: top two bits for
    /// 8/16-bit storage (`0xC0`/`0xC000`) — DNS-style `11xxxxxx` compression
    /// pointers generalized to wider storage.
    pub fn pointer_tag_mask(self) -> u64 {
        match self {
            StorageWidth::Uint8 => 0xC0,
            StorageWidth::Uint16 => 0xC000,
            StorageWidth::Uint32 => 0xC000_0000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetBase {
    MessageStart,
    CurrentPosition,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackRefSpec {
    pub storage_width: StorageWidth,
    #[serde(deserialize_with = "deserialize_number_from_string")]
    pub offset_mask: u64,
    pub offset_base: OffsetBase,
    pub target: String,
    #[serde(default)]
    pub endianness: Option<Endianness>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceType {
    Bit,
    Byte,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OptionalDescriptor {
    pub value_type: Box<Descriptor>,
    #[serde(default = "default_presence_type")]
    pub presence_type: PresenceType,
}

fn default_presence_type() -> PresenceType {
    PresenceType::Byte
}

// ---------------------------------------------------------------------
// Computed fields
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ComputedSpec {
    LengthOf {
        target: TargetPathSpec,
        #[serde(default)]
        encoding: Option<StringEncoding>,
    },
    Crc32Of {
        target: TargetPathSpec,
    },
    PositionOf {
        target: TargetPathSpec,
    },
    SumOfSizes {
        targets: Vec<TargetPathSpec>,
    },
    SumOfTypeSizes {
        array: TargetPathSpec,
        element_type: String,
    },
}

/// Raw YAML form of a target path; parsed into [`TargetPath`] by the
/// planner (which is where failures become actionable [`PlanError`]s tied
/// to a type/field).
pub type TargetPathSpec = String;

/// A parsed computed-field / conditional target path: bare names, `../`
/// relative parent walks, `_root.` absolute, and indexed selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    pub root: PathRoot,
    pub ups: u32,
    pub steps: Vec<PathStep>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRoot {
    Local,
    Root,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    Field(String),
    Indexed {
        array_field: String,
        selector: Selector,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    First(String),
    Last(String),
    /// `corresponding<T>`; `same_index<T>` parses to the same variant —
    /// treated as strict synonyms, with `corresponding` canonical.
    Corresponding(String),
}

impl TargetPath {
    /// Parses `../../foo`, `_root.a.b`, `items[first<Chunk>]`, etc.
    pub fn parse(raw: &str) -> Result<TargetPath, String> {
        let mut s = raw;
        let mut ups = 0u32;
        let mut root = PathRoot::Local;
        if let Some(rest) = s.strip_prefix("_root.") {
            root = PathRoot::Root;
            s = rest;
        } else {
            while let Some(rest) = s.strip_prefix("../") {
                ups += 1;
                s = rest;
            }
        }
        if s.is_empty() {
            return Err(format!("empty target path in `{raw}`"));
        }
        let mut steps = Vec::new();
        for part in s.split('.') {
            steps.push(parse_step(part)?);
        }
        Ok(TargetPath { root, ups, steps })
    }
}

fn parse_step(part: &str) -> Result<PathStep, String> {
    if let Some(open) = part.find('[') {
        let close = part
            .strip_suffix(']')
            .ok_or_else(|| format!("unterminated selector in `{part}`"))?;
        let array_field = part[..open].to_string();
        let inner = &close[open + 1..];
        let selector = parse_selector(inner)?;
        Ok(PathStep::Indexed {
            array_field,
            selector,
        })
    } else {
        Ok(PathStep::Field(part.to_string()))
    }
}

fn parse_selector(inner: &str) -> Result<Selector, String> {
    let (kind, ty) = inner
        .split_once('<')
        .ok_or_else(|| format!("malformed selector `{inner}`"))?;
    let ty = ty
        .strip_suffix('>')
        .ok_or_else(|| format!("malformed selector `{inner}`"))?;
    match kind {
        "first" => Ok(Selector::First(ty.to_string())),
        "last" => Ok(Selector::Last(ty.to_string())),
        "corresponding" | "same_index" => Ok(Selector::Corresponding(ty.to_string())),
        other => Err(format!("unknown selector kind `{other}`")),
    }
}

// ---------------------------------------------------------------------
// Identifier sanitization
// ---------------------------------------------------------------------

/// Rust reserved words and prelude type names that must not appear verbatim
/// as generated identifiers. Checked both where a name denotes a type and
/// where it denotes a field/variable/enum member.
const RESERVED: &[&str] = &[
    "as", "break", "const", "continue", "crate", "dyn", "else", "enum", "extern", "false", "fn",
    "for", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref",
    "return", "self", "Self", "static", "struct", "super", "trait", "true", "type", "unsafe",
    "use", "where", "while", "async", "await", "dyn", "String", "Vec", "Option", "Result", "Box",
    "str",
];

/// Deterministic, idempotent escaping of a name that collides with a Rust
/// reserved word or a common prelude type. Running this twice on an
/// already-sanitized name is a no-op.
pub fn sanitize_ident(name: &str) -> String {
    if RESERVED.contains(&name) {
        format!("{name}_")
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parsing {
        use super::*;

        #[test]
        fn minimal_schema_parses() {
            let yaml = r#"
                version: '1.0'
                types: {}
            "#;
            let schema = Schema::from_yaml(yaml).unwrap();
            assert_eq!(schema.types.len(), 0);
        }

        #[test]
        fn rejects_unknown_version() {
            let yaml = r#"
                version: '2.0'
                types: {}
            "#;
            match Schema::from_yaml(yaml) {
                Err(SchemaError::InvalidVersion(v)) => assert_eq!(v, "2.0"),
                other => panic!("expected InvalidVersion, got {other:?}"),
            }
        }

        #[test]
        fn rejects_lowercase_type_name() {
            let yaml = r#"
                version: '1.0'
                types:
                  bad_name:
                    kind: uint8
            "#;
            assert!(matches!(
                Schema::from_yaml(yaml),
                Err(SchemaError::InvalidTypeName(_))
            ));
        }

        #[test]
        fn composite_with_primitive_fields() {
            let yaml = r#"
                version: '1.0'
                types:
                  SensorReading:
                    fields:
                      - name: device_id
                        kind: uint16
                        endianness: big
                      - name: temperature
                        kind: float32
            "#;
            let schema = Schema::from_yaml(yaml).unwrap();
            let def = &schema.types["SensorReading"];
            assert!(!Schema::is_alias(def));
            let fields = schema.get_fields(def);
            assert_eq!(fields.len(), 2);
            assert_eq!(fields[0].name, "device_id");
            assert!(matches!(fields[0].descriptor, Descriptor::Uint16));
        }

        #[test]
        fn string_alias_is_not_treated_as_plain_alias() {
            let yaml = r#"
                version: '1.0'
                types:
                  S:
                    kind: string
                    array_kind: length_prefixed
                    length_type: uint8
                    encoding: utf8
            "#;
            let schema = Schema::from_yaml(yaml).unwrap();
            let def = &schema.types["S"];
            assert!(!Schema::is_alias(def));
        }
    }

    mod templates {
        use super::*;

        #[test]
        fn resolves_simple_template() {
            let yaml = r#"
                version: '1.0'
                types:
                  "Optional<T>":
                    kind: optional
                    presence_type: byte
                    value_type:
                      kind: type_ref
                      name: T
                  Header:
                    kind: uint32
            "#;
            let schema = Schema::from_yaml(yaml).unwrap();
            let resolved = schema.resolve_template("Optional<Header>").unwrap();
            match resolved {
                TypeDef::Alias(Descriptor::Optional(o)) => match *o.value_type {
                    Descriptor::TypeRef(r) => assert_eq!(r.name, "Header"),
                    other => panic!("expected TypeRef, got {other:?}"),
                },
                other => panic!("expected Optional alias, got {other:?}"),
            }
        }
    }

    mod target_paths {
        use super::*;

        #[test]
        fn bare_name() {
            let p = TargetPath::parse("length").unwrap();
            assert_eq!(p.root, PathRoot::Local);
            assert_eq!(p.ups, 0);
            assert_eq!(p.steps, vec![PathStep::Field("length".into())]);
        }

        #[test]
        fn parent_walk() {
            let p = TargetPath::parse("../../footer").unwrap();
            assert_eq!(p.ups, 2);
            assert_eq!(p.steps, vec![PathStep::Field("footer".into())]);
        }

        #[test]
        fn root_absolute() {
            let p = TargetPath::parse("_root.header.length").unwrap();
            assert_eq!(p.root, PathRoot::Root);
            assert_eq!(
                p.steps,
                vec![
                    PathStep::Field("header".into()),
                    PathStep::Field("length".into())
                ]
            );
        }

        #[test]
        fn indexed_selectors() {
            let p = TargetPath::parse("items[first<Chunk>]").unwrap();
            assert_eq!(
                p.steps,
                vec![PathStep::Indexed {
                    array_field: "items".into(),
                    selector: Selector::First("Chunk".into())
                }]
            );

            let p2 = TargetPath::parse("items[corresponding<Chunk>]").unwrap();
            assert_eq!(
                p2.steps,
                vec![PathStep::Indexed {
                    array_field: "items".into(),
                    selector: Selector::Corresponding("Chunk".into())
                }]
            );

            let p3 = TargetPath::parse("items[same_index<Chunk>]").unwrap();
            assert_eq!(p2.steps, p3.steps, "same_index is a synonym of corresponding");
        }
    }

    mod idents {
        use super::*;

        #[test]
        fn reserved_words_get_suffixed() {
            assert_eq!(sanitize_ident("type"), "type_");
            assert_eq!(sanitize_ident("String"), "String_");
            assert_eq!(sanitize_ident("device_id"), "device_id");
        }

        #[test]
        fn idempotent() {
            let once = sanitize_ident("type");
            let twice = sanitize_ident(&once);
            assert_eq!(once, twice);
        }
    }
}
