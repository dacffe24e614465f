//! # Codegen Emitter
//!
//! Converts a [`Plan`] into target-language (Rust) source text. Organized
//! by descriptor kind, with paired `encode_*`/`decode_*` functions per
//! kind, each threading a *value path* — an already-formatted Rust
//! expression string naming where the value currently lives (`self.foo`,
//! `item`, a local `let` binding) — through the traversal.
//!
//! Two scope decisions worth recording up front (see DESIGN.md for the
//! full list):
//! - Computed fields never appear in a generated struct on either side:
//!   decode keeps them as transient `let` bindings for as long as a
//!   sibling needs them (typically a `field_referenced` array's length),
//!   encode always recomputes them from the fields they describe, so the
//!   public input shape omits computed fields without needing two shapes
//!   per type.
//! - `position_of` only resolves bare-name targets that precede the
//!   computed field in declaration order, using an offset captured right
//!   before that target was encoded. The Bit Stream Runtime's encoder is
//!   an append-only sink (mirroring `bitstream_io`'s `BitWriter`, which
//!   exposes no mid-stream patch), so a forward reference would need a
//!   byte-patching primitive this crate does not build.

use std::fmt::Write as _;

use crate::planner::Plan;
use crate::schema::{
    ArrayDescriptor, ArrayKind, BackRefSpec, BitfieldDescriptor, ChoiceDescriptor, Composite,
    ComputedSpec, Descriptor, DiscriminatedUnionDescriptor, DiscriminatorSpec, Endianness, Field,
    Instance, OptionalDescriptor, PathRoot, PathStep, PositionExpr, PresenceType, PrimitiveWidth,
    Schema, Selector, StorageWidth, StringDescriptor, StringEncoding, TargetPath, TypeDef,
};

/// Generates the full source text for one schema: one Rust module per
/// plan-emitted type, in declaration order.
pub fn generate(plan: &Plan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "// @generated by binschema. Do not edit by hand.");
    let _ = writeln!(out, "#![allow(dead_code, clippy::all, unused_variables)]");
    let _ = writeln!(out, "use binschema::bitstream::{{Decoder, EncodeError, Encoder, DecodeError}};");
    let _ = writeln!(out, "use binschema::crc32::crc32_ieee;");
    let _ = writeln!(out, "use binschema::error::LazyEvalError;");
    let _ = writeln!(out, "use binschema::expr::{{self, ExprContext}};");
    let _ = writeln!(out, "use binschema::schema::{{BitOrder, Endianness}};");
    let _ = writeln!(out);

    for name in &plan.emission_order {
        let type_def = &plan.schema.types[name];
        match type_def {
            TypeDef::Composite(c) => emit_composite(&mut out, plan, name, c),
            TypeDef::Alias(d) => emit_alias(&mut out, plan, name, d),
        }
        let _ = writeln!(out);
    }
    out
}

// ---------------------------------------------------------------------
// Name mangling / type mapping
// ---------------------------------------------------------------------

/// Turns a possibly-parameterized schema type name (`Optional<Header>`)
/// into a valid Rust identifier (`Optional_Header`).
fn mangle(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

fn field_ident(name: &str) -> String {
    crate::schema::sanitize_ident(name)
}

/// True for descriptors whose decoded local is a plain Rust integer (and so
/// can be bound into a predicate-evaluation context via `as i64`).
fn is_integer_like(d: &Descriptor) -> bool {
    matches!(
        d,
        Descriptor::Bit { .. }
            | Descriptor::Uint8
            | Descriptor::Uint16
            | Descriptor::Uint32
            | Descriptor::Uint64
            | Descriptor::Int8
            | Descriptor::Int16
            | Descriptor::Int32
            | Descriptor::Int64
            | Descriptor::Bitfield(_)
    )
}

fn rust_width_type(bits: u32) -> &'static str {
    match bits {
        0..=8 => "u8",
        9..=16 => "u16",
        17..=32 => "u32",
        _ => "u64",
    }
}

fn primitive_width_rust(w: PrimitiveWidth) -> &'static str {
    match w {
        PrimitiveWidth::Uint8 => "u8",
        PrimitiveWidth::Uint16 => "u16",
        PrimitiveWidth::Uint32 => "u32",
        PrimitiveWidth::Uint64 => "u64",
    }
}

fn rust_type(schema: &Schema, d: &Descriptor) -> String {
    match d {
        Descriptor::Bit { size } => rust_width_type(*size as u32).to_string(),
        Descriptor::Uint8 => "u8".into(),
        Descriptor::Uint16 => "u16".into(),
        Descriptor::Uint32 => "u32".into(),
        Descriptor::Uint64 => "u64".into(),
        Descriptor::Int8 => "i8".into(),
        Descriptor::Int16 => "i16".into(),
        Descriptor::Int32 => "i32".into(),
        Descriptor::Int64 => "i64".into(),
        Descriptor::Float32 => "f32".into(),
        Descriptor::Float64 => "f64".into(),
        Descriptor::Bitfield(_) => "u64".into(),
        Descriptor::Array(a) => format!("Vec<{}>", rust_type(schema, &a.items)),
        Descriptor::String(_) => "String".into(),
        Descriptor::Optional(o) => format!("Option<{}>", rust_type(schema, &o.value_type)),
        Descriptor::TypeRef(r) => mangle(&if r.type_args.is_empty() {
            r.name.clone()
        } else {
            format!("{}<{}>", r.name, r.type_args.join(","))
        }),
        Descriptor::BackReference(b) => mangle(&b.target),
        // Named enums are emitted alongside the owning field; callers look
        // the type name up by the same mangling scheme the field emitter uses.
        Descriptor::DiscriminatedUnion(_) | Descriptor::Choice(_) => "UNION_PLACEHOLDER".into(),
    }
}

/// Field/element rust type, resolving the union/choice placeholder against
/// the concrete per-field enum name. A union/choice may sit directly on the
/// field, or be wrapped in an `array`/`optional` (the enum still takes its
/// name from the owning field, matching `emit_union_enums`).
fn field_rust_type(schema: &Schema, type_name: &str, field_name: &str, d: &Descriptor) -> String {
    let enum_name = || format!("{}_{}", mangle(type_name), mangle_field(field_name));
    match d {
        Descriptor::DiscriminatedUnion(_) | Descriptor::Choice(_) => enum_name(),
        Descriptor::Array(a) if union_enum_variants(&a.items).is_some() => {
            format!("Vec<{}>", enum_name())
        }
        Descriptor::Optional(o) if union_enum_variants(&o.value_type).is_some() => {
            format!("Option<{}>", enum_name())
        }
        other => rust_type(schema, other),
    }
}

/// Returns the `(target_type_name, tag)` list of a union/choice descriptor,
/// if `d` is (or wraps) one — used both to decide whether a field's Rust
/// type needs the per-field enum and to emit that enum's variants.
fn union_enum_variants(d: &Descriptor) -> Option<Vec<String>> {
    match d {
        Descriptor::DiscriminatedUnion(u) => Some(u.variants.iter().map(|v| v.target.clone()).collect()),
        Descriptor::Choice(c) => Some(c.choices.iter().map(|v| v.target.clone()).collect()),
        _ => None,
    }
}

fn mangle_field(name: &str) -> String {
    let s = mangle(name);
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => s,
    }
}

fn endianness_expr(e: Option<Endianness>) -> &'static str {
    match e {
        Some(Endianness::Big) | None => "Endianness::Big",
        Some(Endianness::Little) => "Endianness::Little",
    }
}

/// A field's effective endianness: its own override if declared, else the
/// schema's global default.
fn field_endianness(plan: &Plan, field: &Field) -> Endianness {
    field.endianness.unwrap_or(plan.schema.config.default_endianness)
}

// ---------------------------------------------------------------------
// Composite / alias emission
// ---------------------------------------------------------------------

fn emit_composite(out: &mut String, plan: &Plan, name: &str, c: &Composite) {
    let schema = &plan.schema;
    let ty = mangle(name);

    if let Some(desc) = &c.description {
        let _ = writeln!(out, "/// {desc}");
    }
    let _ = writeln!(out, "#[derive(Debug, Clone, PartialEq)]");
    let _ = writeln!(out, "pub struct {ty} {{");
    for field in &c.fields {
        if field.computed.is_some() {
            continue;
        }
        let base = field_rust_type(schema, name, &field.name, &field.descriptor);
        let ty_str = if field.conditional.is_some() {
            format!("Option<{base}>")
        } else {
            base
        };
        let _ = writeln!(out, "    pub {}: {ty_str},", field_ident(&field.name));
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);

    emit_union_enums(out, plan, name, c);

    let _ = writeln!(out, "impl {ty} {{");
    emit_composite_encode(out, plan, name, c);
    emit_composite_decode(out, plan, name, c);
    let _ = writeln!(out, "}}");

    if !c.instances.is_empty() {
        emit_instance_wrapper(out, plan, name, c);
    }
}

/// Emits the per-field enum declarations backing any `discriminated_union`
/// or `choice` field on this composite, whether it sits directly on the
/// field or is wrapped in an `array`/`optional`.
fn emit_union_enums(out: &mut String, plan: &Plan, type_name: &str, c: &Composite) {
    let _ = &plan.schema;
    for field in &c.fields {
        let inner = match &field.descriptor {
            Descriptor::Array(a) => &a.items,
            Descriptor::Optional(o) => &o.value_type,
            other => other,
        };
        let Some(variants) = union_enum_variants(inner) else {
            continue;
        };
        let enum_name = format!("{}_{}", mangle(type_name), mangle_field(&field.name));
        let _ = writeln!(out, "#[derive(Debug, Clone, PartialEq)]");
        let _ = writeln!(out, "pub enum {enum_name} {{");
        for target in &variants {
            let _ = writeln!(out, "    {}({}),", mangle_field(target), mangle(target));
        }
        let _ = writeln!(out, "}}");
        let _ = writeln!(out);
    }
}

fn emit_alias(out: &mut String, plan: &Plan, name: &str, d: &Descriptor) {
    let schema = &plan.schema;
    let ty = mangle(name);
    let inner = rust_type(schema, d);
    let _ = writeln!(out, "pub type {ty} = {inner};");
    let _ = writeln!(out);
    let _ = writeln!(out, "pub fn encode_{}(value: &{ty}, enc: &mut Encoder) -> Result<(), EncodeError> {{", ty.to_lowercase());
    let body = encode_descriptor_stmts(plan, name, "<alias>", d, "enc", "value", schema.config.default_endianness);
    out.push_str(&indent(&body, "    "));
    let _ = writeln!(out, "    Ok(())");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "pub fn decode_{}(dec: &mut Decoder) -> Result<{ty}, DecodeError> {{", ty.to_lowercase());
    let expr = decode_descriptor_expr(plan, name, "<alias>", d, "dec", schema.config.default_endianness);
    let _ = writeln!(out, "    Ok({expr})");
    let _ = writeln!(out, "}}");
}

fn indent(s: &str, prefix: &str) -> String {
    s.lines()
        .map(|l| if l.is_empty() { l.to_string() } else { format!("{prefix}{l}\n") })
        .collect()
}

// ---------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------

fn emit_composite_encode(out: &mut String, plan: &Plan, type_name: &str, c: &Composite) {
    let _ = writeln!(out, "    /// Writes every field in declaration order.");
    let _ = writeln!(out, "    pub fn encode(&self, enc: &mut Encoder) -> Result<(), EncodeError> {{");
    for field in &c.fields {
        let access = format!("self.{}", field_ident(&field.name));
        let end = field_endianness(plan, field);
        if let Some(computed) = &field.computed {
            let value_expr = computed_encode_value(plan, type_name, field, computed);
            let body = encode_descriptor_stmts(
                plan,
                type_name,
                &field.name,
                &field.descriptor,
                "enc",
                &value_expr,
                end,
            );
            out.push_str(&indent(&body, "        "));
            let _ = writeln!(out, "        let _{}_offset = enc.byte_offset();", field_ident(&field.name));
            continue;
        }
        let _ = writeln!(out, "        let _{}_offset = enc.byte_offset();", field_ident(&field.name));
        if field.conditional.is_some() {
            let _ = writeln!(out, "        if let Some(ref __v) = {access} {{");
            let body =
                encode_descriptor_stmts(plan, type_name, &field.name, &field.descriptor, "enc", "__v", end);
            out.push_str(&indent(&body, "            "));
            let _ = writeln!(out, "        }}");
        } else {
            let body = encode_descriptor_stmts(
                plan,
                type_name,
                &field.name,
                &field.descriptor,
                "enc",
                &access,
                end,
            );
            out.push_str(&indent(&body, "        "));
        }
    }
    let _ = writeln!(out, "        Ok(())");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);
}

/// Rust integer type a computed field's own declared `kind` occupies on the
/// wire — falls back to `u32` only for descriptors with no static width
/// (shouldn't occur for a computed field's scalar descriptor in practice).
fn computed_value_rust_type(d: &Descriptor) -> &'static str {
    d.static_bit_width()
        .map(|bits| rust_width_type(bits as u32))
        .unwrap_or("u32")
}

fn computed_encode_value(plan: &Plan, type_name: &str, field: &Field, spec: &ComputedSpec) -> String {
    let targets = plan
        .computed_targets
        .get(&(type_name.to_string(), field.name.clone()));
    let ty = computed_value_rust_type(&field.descriptor);
    let raw = match spec {
        ComputedSpec::LengthOf { encoding, .. } => {
            let target = bare_target_access(targets);
            match encoding {
                Some(StringEncoding::Utf8) => format!("{target}.as_bytes().len()"),
                _ => format!("{target}.len()"),
            }
        }
        ComputedSpec::Crc32Of { .. } => {
            let target_path = targets.and_then(|v| v.first());
            let target = bare_target_access(targets);
            let bytes_expr = match target_path.and_then(bare_field_name).and_then(|name| {
                let TypeDef::Composite(c) = plan.schema.types.get(type_name)? else {
                    return None;
                };
                c.fields.iter().find(|f| f.name == name).map(|f| f.descriptor.clone())
            }) {
                Some(Descriptor::String(_)) => format!("{target}.as_bytes()"),
                _ => format!("{target}.as_slice()"),
            };
            return format!("(crc32_ieee({bytes_expr}) as {ty})");
        }
        ComputedSpec::PositionOf { .. } => {
            let target = plan
                .computed_targets
                .get(&(type_name.to_string(), field.name.clone()))
                .and_then(|v| v.first());
            match target {
                Some(path) => match bare_field_name(path) {
                    Some(name) => format!("_{}_offset", field_ident(&name)),
                    None => indexed_position_expr(path)
                        .unwrap_or_else(|| "0xFFFF_FFFF_u64".to_string()),
                },
                None => "0".to_string(),
            }
        }
        ComputedSpec::SumOfSizes { .. } => {
            let parts: Vec<String> = targets
                .map(|v| {
                    v.iter()
                        .filter_map(bare_field_name)
                        .map(|n| format!("(self.{}.len() as u64)", field_ident(&n)))
                        .collect()
                })
                .unwrap_or_default();
            if parts.is_empty() {
                "0".to_string()
            } else {
                format!("({})", parts.join(" + "))
            }
        }
        ComputedSpec::SumOfTypeSizes { array, element_type } => {
            let array_name = bare_field_name(&TargetPath::parse(array).unwrap_or(TargetPath {
                root: PathRoot::Local,
                ups: 0,
                steps: vec![],
            }))
            .unwrap_or_default();
            match array_item_enum_name(plan, type_name, &array_name) {
                Some(enum_name) => format!(
                    "(self.{}.iter().filter(|__i| matches!(__i, {}::{}(_))).count())",
                    field_ident(&array_name),
                    enum_name,
                    mangle_field(element_type)
                ),
                // `array` doesn't name an array-of-union/choice field on this
                // type; nothing to count.
                None => "0".to_string(),
            }
        }
    };
    format!("({raw} as {ty})")
}

/// Finds the `discriminated_union`/`choice` enum name backing an array
/// field's items, for `sum_of_type_sizes`'s generated `matches!` pattern —
/// mirrors the naming `emit_union_enums` gives that field's enum.
fn array_item_enum_name(plan: &Plan, type_name: &str, array_field_name: &str) -> Option<String> {
    let TypeDef::Composite(c) = plan.schema.types.get(type_name)? else {
        return None;
    };
    let field = c.fields.iter().find(|f| f.name == array_field_name)?;
    let Descriptor::Array(a) = &field.descriptor else {
        return None;
    };
    match a.items.as_ref() {
        Descriptor::DiscriminatedUnion(_) | Descriptor::Choice(_) => {
            Some(format!("{}_{}", mangle(type_name), mangle_field(&field.name)))
        }
        _ => None,
    }
}

/// Name of the local a previously-decoded sibling field is bound to —
/// `_{ident}_computed` for a computed field, `{ident}` for a plain one.
/// Falls back to the plain form if `field_name` isn't found on `type_name`
/// (shouldn't happen for a well-formed schema).
fn sibling_decoded_local(plan: &Plan, type_name: &str, field_name: &str) -> String {
    let ident = field_ident(field_name);
    let is_computed = match plan.schema.types.get(type_name) {
        Some(TypeDef::Composite(c)) => c
            .fields
            .iter()
            .find(|f| f.name == field_name)
            .is_some_and(|f| f.computed.is_some()),
        _ => false,
    };
    if is_computed {
        format!("_{ident}_computed")
    } else {
        ident
    }
}

fn bare_target_access(targets: Option<&Vec<TargetPath>>) -> String {
    targets
        .and_then(|v| v.first())
        .and_then(bare_field_name)
        .map(|n| format!("self.{}", field_ident(&n)))
        .unwrap_or_else(|| "self /* unresolved computed target */".to_string())
}

/// Renders `arr[first<T>]`/`arr[last<T>]`/`arr[corresponding<T>]` position
/// lookups against the encoder's per-array position tables. Absence (no item
/// of that type was written, or `corresponding<T>` used outside iteration of
/// the matching array) renders as `0xFFFFFFFF`.
fn indexed_position_expr(path: &TargetPath) -> Option<String> {
    let step = path.steps.last()?;
    let (array_field, selector) = match step {
        PathStep::Indexed { array_field, selector } => (array_field, selector),
        _ => return None,
    };
    Some(match selector {
        Selector::First(item_type) => format!(
            "(enc.first_position(\"{array_field}\", \"{item_type}\").unwrap_or(0xFFFF_FFFF_u64))"
        ),
        Selector::Last(item_type) => format!(
            "(enc.last_position(\"{array_field}\", \"{item_type}\").unwrap_or(0xFFFF_FFFF_u64))"
        ),
        Selector::Corresponding(item_type) => format!(
            "(enc.corresponding_position(\"{array_field}\", \"{item_type}\")?.unwrap_or(0xFFFF_FFFF_u64))"
        ),
    })
}

fn bare_field_name(path: &TargetPath) -> Option<String> {
    if path.ups == 0 && matches!(path.root, PathRoot::Local) && path.steps.len() == 1 {
        match &path.steps[0] {
            PathStep::Field(n) => Some(n.clone()),
            _ => None,
        }
    } else {
        None
    }
}

/// Emits statements that encode `value_expr` (of the Rust type
/// corresponding to `d`) via `enc_var`.
fn encode_descriptor_stmts(
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    d: &Descriptor,
    enc_var: &str,
    value_expr: &str,
    end: Endianness,
) -> String {
    let schema = &plan.schema;
    let mut out = String::new();
    match d {
        Descriptor::Bit { size } => {
            let _ = writeln!(out, "{enc_var}.write_bits({value_expr} as u64, {size})?;");
        }
        Descriptor::Uint8 => {
            let _ = writeln!(out, "{enc_var}.write_uint8({value_expr})?;");
        }
        Descriptor::Uint16 => {
            let _ = writeln!(out, "{enc_var}.write_uint16({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Uint32 => {
            let _ = writeln!(out, "{enc_var}.write_uint32({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Uint64 => {
            let _ = writeln!(out, "{enc_var}.write_uint64({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Int8 => {
            let _ = writeln!(out, "{enc_var}.write_int8({value_expr})?;");
        }
        Descriptor::Int16 => {
            let _ = writeln!(out, "{enc_var}.write_int16({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Int32 => {
            let _ = writeln!(out, "{enc_var}.write_int32({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Int64 => {
            let _ = writeln!(out, "{enc_var}.write_int64({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Float32 => {
            let _ = writeln!(out, "{enc_var}.write_float32({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Float64 => {
            let _ = writeln!(out, "{enc_var}.write_float64({value_expr}, {})?;", endianness_expr(Some(end)));
        }
        Descriptor::Bitfield(b) => encode_bitfield(&mut out, b, value_expr),
        Descriptor::Array(a) => encode_array(&mut out, plan, type_name, field_name, a, enc_var, value_expr, end),
        Descriptor::String(s) => encode_string(&mut out, s, enc_var, value_expr, end),
        Descriptor::Optional(o) => encode_optional(&mut out, plan, type_name, field_name, o, enc_var, value_expr, end),
        Descriptor::DiscriminatedUnion(_) | Descriptor::Choice(_) => {
            encode_union_or_choice(&mut out, plan, type_name, field_name, d, enc_var, value_expr)
        }
        Descriptor::BackReference(b) => encode_back_reference(&mut out, b, enc_var, value_expr),
        Descriptor::TypeRef(r) => {
            let resolved = schema.resolve_template(&full_ref_name(r));
            match resolved {
                Ok(TypeDef::Composite(_)) => {
                    let _ = writeln!(out, "{value_expr}.encode({enc_var})?;");
                }
                Ok(TypeDef::Alias(inner)) if Schema::is_alias(&TypeDef::Alias(inner.clone())) => {
                    let nested =
                        encode_descriptor_stmts(plan, type_name, field_name, &inner, enc_var, value_expr, end);
                    out.push_str(&nested);
                }
                _ => {
                    let _ = writeln!(
                        out,
                        "{enc_var}.write_der_varint(0)?; // placeholder: unresolved type_ref `{}`",
                        r.name
                    );
                }
            }
        }
    }
    out
}

fn full_ref_name(r: &crate::schema::TypeRefDescriptor) -> String {
    if r.type_args.is_empty() {
        r.name.clone()
    } else {
        format!("{}<{}>", r.name, r.type_args.join(","))
    }
}

fn encode_bitfield(out: &mut String, b: &BitfieldDescriptor, value_expr: &str) {
    let _ = writeln!(out, "{{");
    let _ = writeln!(out, "    let __bf = {value_expr};");
    for sub in &b.fields {
        let _ = writeln!(
            out,
            "    enc.write_bits(((__bf >> {}) & ((1u64 << {}) - 1)), {})?;",
            sub.offset, sub.size, sub.size
        );
    }
    let _ = writeln!(out, "}}");
}

fn encode_optional(
    out: &mut String,
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    o: &OptionalDescriptor,
    enc_var: &str,
    value_expr: &str,
    end: Endianness,
) {
    let _ = writeln!(out, "match {value_expr} {{");
    let _ = writeln!(out, "    Some(__inner) => {{");
    match o.presence_type {
        PresenceType::Bit => {
            let _ = writeln!(out, "        {enc_var}.write_bits(1, 1)?;");
        }
        PresenceType::Byte => {
            let _ = writeln!(out, "        {enc_var}.write_uint8(1)?;");
        }
    }
    let inner = encode_descriptor_stmts(plan, type_name, field_name, &o.value_type, enc_var, "__inner", end);
    out.push_str(&indent(&inner, "        "));
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "    None => {{");
    match o.presence_type {
        PresenceType::Bit => {
            let _ = writeln!(out, "        {enc_var}.write_bits(0, 1)?;");
        }
        PresenceType::Byte => {
            let _ = writeln!(out, "        {enc_var}.write_uint8(0)?;");
        }
    }
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
}

fn encode_back_reference(out: &mut String, b: &BackRefSpec, enc_var: &str, value_expr: &str) {
    let mask = b.offset_mask;
    let tag = b.storage_width.pointer_tag_mask();
    let write_word = match b.storage_width {
        StorageWidth::Uint8 => "write_uint8",
        StorageWidth::Uint16 => "write_uint16",
        StorageWidth::Uint32 => "write_uint32",
    };
    let _ = writeln!(out, "{{");
    let _ = writeln!(out, "    let __key = format!(\"{{:?}}\", {value_expr});");
    let _ = writeln!(out, "    if let Some(__off) = {enc_var}.dict_lookup(__key.as_bytes()) {{");
    if matches!(b.storage_width, StorageWidth::Uint8) {
        let _ = writeln!(
            out,
            "        {enc_var}.{write_word}(((({tag}u64) | (__off & {mask}u64)) as u8))?;"
        );
    } else {
        let _ = writeln!(
            out,
            "        {enc_var}.{write_word}(((({tag}u64) | (__off & {mask}u64)) as _), {})?;",
            endianness_expr(b.endianness)
        );
    }
    let _ = writeln!(out, "    }} else {{");
    let _ = writeln!(out, "        let __off = {enc_var}.byte_offset();");
    let _ = writeln!(out, "        {enc_var}.dict_record(__key.into_bytes(), __off);");
    let _ = writeln!(out, "        {value_expr}.encode({enc_var})?;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");
}

fn encode_union_or_choice(
    out: &mut String,
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    d: &Descriptor,
    enc_var: &str,
    value_expr: &str,
) {
    let enum_name = format!("{}_{}", mangle(type_name), mangle_field(field_name));
    let _ = writeln!(out, "match {value_expr} {{");
    let targets: Vec<String> = match d {
        Descriptor::DiscriminatedUnion(u) => u.variants.iter().map(|v| v.target.clone()).collect(),
        Descriptor::Choice(c) => c.choices.iter().map(|v| v.target.clone()).collect(),
        _ => vec![],
    };
    for (idx, target) in targets.iter().enumerate() {
        let variant = mangle_field(target);
        let _ = writeln!(out, "    {enum_name}::{variant}(__v) => {{");
        if let Descriptor::Choice(c) = d {
            if let Some(Some(tag)) = c.choices.get(idx).map(|v| v.tag) {
                let _ = writeln!(out, "        {enc_var}.write_uint8({tag}u8 as u8)?;");
            } else if c.discriminant_type.is_some() {
                let _ = writeln!(out, "        {enc_var}.write_uint8({}u8)?;", idx + 1);
            }
        }
        let _ = writeln!(out, "        __v.encode({enc_var})?;");
        let _ = writeln!(out, "    }}");
        let _ = plan;
    }
    let _ = writeln!(out, "}}");
}

fn encode_array(
    out: &mut String,
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    a: &ArrayDescriptor,
    enc_var: &str,
    value_expr: &str,
    end: Endianness,
) {
    let schema = &plan.schema;
    match &a.kind {
        ArrayKind::Fixed { .. } | ArrayKind::FieldReferenced { .. } | ArrayKind::EofTerminated => {
            let tracked = plan.tracked_arrays.contains_key(field_name);
            if tracked {
                let _ = writeln!(out, "{enc_var}.enter_array(\"{field_name}\");");
            }
            let _ = writeln!(out, "for __item in {value_expr}.iter() {{");
            let body = encode_descriptor_stmts(plan, type_name, field_name, &a.items, enc_var, "__item", end);
            out.push_str(&indent(&body, "    "));
            emit_array_item_tracking_record(out, plan, type_name, field_name, &a.items, enc_var);
            if tracked {
                let _ = writeln!(out, "    {enc_var}.advance_array_index();");
            }
            let _ = writeln!(out, "}}");
            if tracked {
                let _ = writeln!(out, "{enc_var}.exit_array();");
            }
        }
        ArrayKind::LengthPrefixed { length_type } => {
            let _ = writeln!(
                out,
                "{enc_var}.write_uint{}({value_expr}.len() as {}, {})?;",
                primitive_width_bits(*length_type),
                primitive_width_rust(*length_type),
                endianness_expr(Some(end))
            );
            let _ = writeln!(out, "for __item in {value_expr}.iter() {{");
            let body = encode_descriptor_stmts(plan, type_name, field_name, &a.items, enc_var, "__item", end);
            out.push_str(&indent(&body, "    "));
            let _ = writeln!(out, "}}");
        }
        ArrayKind::LengthPrefixedItems {
            length_type,
            item_length_type,
        } => {
            let _ = writeln!(
                out,
                "{enc_var}.write_uint{}({value_expr}.len() as {}, {})?;",
                primitive_width_bits(*length_type),
                primitive_width_rust(*length_type),
                endianness_expr(Some(end))
            );
            let _ = writeln!(out, "for __item in {value_expr}.iter() {{");
            let _ = writeln!(out, "    let mut __scratch = Encoder::new(BitOrder::Msb);");
            let body =
                encode_descriptor_stmts(plan, type_name, field_name, &a.items, "__scratch", "__item", end);
            out.push_str(&indent(&body, "    "));
            let _ = writeln!(out, "    let __bytes = __scratch.finish();");
            let _ = writeln!(
                out,
                "    {enc_var}.write_uint{}(__bytes.len() as {}, {})?;",
                primitive_width_bits(*item_length_type),
                primitive_width_rust(*item_length_type),
                endianness_expr(Some(end))
            );
            let _ = writeln!(out, "    for __b in &__bytes {{ {enc_var}.write_uint8(*__b)?; }}");
            let _ = writeln!(out, "}}");
        }
        ArrayKind::NullTerminated { .. } => {
            let _ = writeln!(out, "for __item in {value_expr}.iter() {{");
            let body = encode_descriptor_stmts(plan, type_name, field_name, &a.items, enc_var, "__item", end);
            out.push_str(&indent(&body, "    "));
            let _ = writeln!(out, "}}");
            let _ = writeln!(out, "{enc_var}.write_uint8(0)?;");
        }
        ArrayKind::SignatureTerminated {
            terminator_value,
            terminator_type,
            endianness,
        } => {
            let _ = writeln!(out, "for __item in {value_expr}.iter() {{");
            let body = encode_descriptor_stmts(plan, type_name, field_name, &a.items, enc_var, "__item", end);
            out.push_str(&indent(&body, "    "));
            let _ = writeln!(out, "}}");
            let _ = writeln!(
                out,
                "{enc_var}.write_uint{}({terminator_value}u64 as {}, {})?;",
                primitive_width_bits(*terminator_type),
                primitive_width_rust(*terminator_type),
                endianness_expr(terminator_endianness(*endianness, end))
            );
        }
    }
    let _ = schema;
}

/// A terminator/discriminator descriptor may declare its own endianness
/// (it often doesn't share the field's general width); fall back to the
/// field's resolved endianness when it doesn't.
fn terminator_endianness(declared: Option<Endianness>, field_end: Endianness) -> Option<Endianness> {
    Some(declared.unwrap_or(field_end))
}

fn primitive_width_bits(w: PrimitiveWidth) -> u32 {
    w.bits()
}

fn emit_array_item_tracking_record(
    out: &mut String,
    plan: &Plan,
    _type_name: &str,
    field_name: &str,
    items: &Descriptor,
    enc_var: &str,
) {
    if let Some(types) = plan.tracked_arrays.get(field_name) {
        if let Descriptor::TypeRef(r) = items {
            if types.contains(&r.name) {
                let _ = writeln!(
                    out,
                    "{enc_var}.record_item_position(\"{field_name}\", \"{}\");",
                    r.name
                );
            }
        }
    }
}

fn encode_string(out: &mut String, s: &StringDescriptor, enc_var: &str, value_expr: &str, end: Endianness) {
    let s = s.clone().canonicalize();
    let bytes_expr = match s.encoding {
        StringEncoding::Ascii => format!("{value_expr}.as_bytes()"),
        StringEncoding::Utf8 => format!("{value_expr}.as_bytes()"),
    };
    match &s.kind {
        ArrayKind::Fixed { length } => {
            let _ = writeln!(out, "{{");
            let _ = writeln!(out, "    let __bytes = {bytes_expr};");
            let _ = writeln!(out, "    for i in 0..{length}usize {{");
            let _ = writeln!(out, "        {enc_var}.write_uint8(*__bytes.get(i).unwrap_or(&0))?;");
            let _ = writeln!(out, "    }}");
            let _ = writeln!(out, "}}");
        }
        ArrayKind::LengthPrefixed { length_type } => {
            let _ = writeln!(out, "{{");
            let _ = writeln!(out, "    let __bytes = {bytes_expr};");
            let _ = writeln!(
                out,
                "    {enc_var}.write_uint{}(__bytes.len() as {}, {})?;",
                primitive_width_bits(*length_type),
                primitive_width_rust(*length_type),
                endianness_expr(Some(end))
            );
            let _ = writeln!(out, "    for __b in __bytes {{ {enc_var}.write_uint8(*__b)?; }}");
            let _ = writeln!(out, "}}");
        }
        ArrayKind::FieldReferenced { .. } | ArrayKind::EofTerminated => {
            let _ = writeln!(out, "{{");
            let _ = writeln!(out, "    let __bytes = {bytes_expr};");
            let _ = writeln!(out, "    for __b in __bytes {{ {enc_var}.write_uint8(*__b)?; }}");
            let _ = writeln!(out, "}}");
        }
        ArrayKind::NullTerminated { .. } => {
            let _ = writeln!(out, "{{");
            let _ = writeln!(out, "    let __bytes = {bytes_expr};");
            let _ = writeln!(out, "    for __b in __bytes {{ {enc_var}.write_uint8(*__b)?; }}");
            let _ = writeln!(out, "    {enc_var}.write_uint8(0)?;");
            let _ = writeln!(out, "}}");
        }
        ArrayKind::SignatureTerminated {
            terminator_value,
            terminator_type,
            endianness,
        } => {
            let _ = writeln!(out, "{{");
            let _ = writeln!(out, "    let __bytes = {bytes_expr};");
            let _ = writeln!(out, "    for __b in __bytes {{ {enc_var}.write_uint8(*__b)?; }}");
            let _ = writeln!(
                out,
                "    {enc_var}.write_uint{}({terminator_value}u64 as {}, {})?;",
                primitive_width_bits(*terminator_type),
                primitive_width_rust(*terminator_type),
                endianness_expr(*endianness)
            );
            let _ = writeln!(out, "}}");
        }
        ArrayKind::LengthPrefixedItems { .. } => {
            let _ = writeln!(out, "// length_prefixed_items is not meaningful for string kinds");
        }
    }
}

// ---------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------

fn emit_composite_decode(out: &mut String, plan: &Plan, type_name: &str, c: &Composite) {
    let ty = mangle(type_name);
    // A field-sourced discriminated union (`DiscriminatorSpec::Field`) reads a
    // sibling field declared earlier in the same type. Every field here is
    // already bound to its own `let` as it is decoded, in declaration order,
    // rather than filled into a partially-built struct — so the union's
    // dispatch expression can simply name that earlier local directly
    // (see `DiscriminatorSpec::Field` in `decode_discriminated_union`) with
    // no separate if/else-if-per-variant decode shape required.

    let _ = writeln!(out, "    /// Reads every field in declaration order.");
    let _ = writeln!(out, "    pub fn decode(dec: &mut Decoder) -> Result<Self, DecodeError> {{");
    for (idx, field) in c.fields.iter().enumerate() {
        let ident = field_ident(&field.name);
        let end = field_endianness(plan, field);
        if field.computed.is_some() {
            let expr =
                decode_descriptor_expr(plan, type_name, &field.name, &field.descriptor, "dec", end);
            let _ = writeln!(out, "        let _{ident}_computed = {expr};");
            let _ = writeln!(out, "        let _{ident}_offset = dec.byte_offset()?;");
            continue;
        }
        let _ = writeln!(out, "        let _{ident}_offset = dec.byte_offset()?;");
        if let Some(cond) = plan
            .conditions
            .get(&(type_name.to_string(), field.name.clone()))
        {
            let _ = cond;
            // Bind every already-decoded sibling (plain or computed) that
            // carries an integer-castable value, so the predicate can name
            // either a plain field or a computed one.
            let ctx_pairs: Vec<String> = c.fields[..idx]
                .iter()
                .filter(|f| is_integer_like(&f.descriptor))
                .map(|f| {
                    let sib = field_ident(&f.name);
                    let local = if f.computed.is_some() {
                        format!("_{sib}_computed")
                    } else {
                        sib
                    };
                    format!("(\"{}\", {local} as i64)", f.name)
                })
                .collect();
            let _ = writeln!(out, "        let {ident} = if binschema::expr::eval_truthy(");
            let _ = writeln!(
                out,
                "            &{{ static EXPR: std::sync::OnceLock<expr::Expr> = std::sync::OnceLock::new(); EXPR.get_or_init(|| expr::parse({:?}).expect(\"conditional parsed at plan time\")).clone() }},",
                field.conditional.clone().unwrap_or_default()
            );
            let _ = writeln!(out, "            &expr::FieldContext(&[{}]),", ctx_pairs.join(", "));
            let _ = writeln!(out, "        ) {{");
            let expr = decode_descriptor_expr(plan, type_name, &field.name, &field.descriptor, "dec", end);
            let _ = writeln!(out, "            Some({expr})");
            let _ = writeln!(out, "        }} else {{ None }};");
        } else {
            let expr = decode_descriptor_expr(plan, type_name, &field.name, &field.descriptor, "dec", end);
            let _ = writeln!(out, "        let {ident} = {expr};");
        }
    }
    let _ = writeln!(out, "        Ok({ty} {{");
    for field in &c.fields {
        if field.computed.is_some() {
            continue;
        }
        let ident = field_ident(&field.name);
        let _ = writeln!(out, "            {ident},");
    }
    let _ = writeln!(out, "        }})");
    let _ = writeln!(out, "    }}");
}

fn decode_descriptor_expr(
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    d: &Descriptor,
    dec_var: &str,
    end: Endianness,
) -> String {
    let schema = &plan.schema;
    match d {
        Descriptor::Bit { size } => format!("{dec_var}.read_bits({size})? as u64"),
        Descriptor::Uint8 => format!("{dec_var}.read_uint8()?"),
        Descriptor::Uint16 => format!("{dec_var}.read_uint16({})?", endianness_expr(Some(end))),
        Descriptor::Uint32 => format!("{dec_var}.read_uint32({})?", endianness_expr(Some(end))),
        Descriptor::Uint64 => format!("{dec_var}.read_uint64({})?", endianness_expr(Some(end))),
        Descriptor::Int8 => format!("{dec_var}.read_int8()?"),
        Descriptor::Int16 => format!("{dec_var}.read_int16({})?", endianness_expr(Some(end))),
        Descriptor::Int32 => format!("{dec_var}.read_int32({})?", endianness_expr(Some(end))),
        Descriptor::Int64 => format!("{dec_var}.read_int64({})?", endianness_expr(Some(end))),
        Descriptor::Float32 => format!("{dec_var}.read_float32({})?", endianness_expr(Some(end))),
        Descriptor::Float64 => format!("{dec_var}.read_float64({})?", endianness_expr(Some(end))),
        Descriptor::Bitfield(b) => decode_bitfield(b, dec_var),
        Descriptor::Array(a) => decode_array(plan, type_name, field_name, a, dec_var, end),
        Descriptor::String(s) => decode_string(plan, type_name, s, dec_var),
        Descriptor::Optional(o) => decode_optional(plan, type_name, field_name, o, dec_var, end),
        Descriptor::DiscriminatedUnion(u) => decode_discriminated_union(plan, type_name, field_name, u, dec_var),
        Descriptor::Choice(c) => decode_choice(plan, type_name, field_name, c, dec_var),
        Descriptor::BackReference(b) => decode_back_reference(b, dec_var),
        Descriptor::TypeRef(r) => {
            let full = full_ref_name(r);
            match schema.resolve_template(&full) {
                Ok(TypeDef::Composite(_)) => format!("{}::decode({dec_var})?", mangle(&full)),
                Ok(TypeDef::Alias(inner)) if !Schema::is_alias(&TypeDef::Alias(inner.clone())) => {
                    format!("decode_{}({dec_var})?", mangle(&full).to_lowercase())
                }
                Ok(TypeDef::Alias(inner)) => {
                    decode_descriptor_expr(plan, type_name, field_name, &inner, dec_var, end)
                }
                Err(_) => format!("{dec_var}.read_uint8()? as u8 /* unresolved type_ref {full} */"),
            }
        }
    }
}

fn decode_bitfield(b: &BitfieldDescriptor, dec_var: &str) -> String {
    let mut s = format!("{{\n");
    for sub in &b.fields {
        let _ = writeln!(s, "    let __{} = {dec_var}.read_bits({})?;", field_ident(&sub.name), sub.size);
    }
    let combined: Vec<String> = b
        .fields
        .iter()
        .map(|sub| format!("(__{} << {})", field_ident(&sub.name), sub.offset))
        .collect();
    let _ = writeln!(s, "    {}", combined.join(" | "));
    s.push('}');
    s
}

fn decode_optional(
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    o: &OptionalDescriptor,
    dec_var: &str,
    end: Endianness,
) -> String {
    let inner = decode_descriptor_expr(plan, type_name, field_name, &o.value_type, dec_var, end);
    let read_flag = match o.presence_type {
        PresenceType::Bit => format!("{dec_var}.read_bits(1)? != 0"),
        PresenceType::Byte => format!("{dec_var}.read_uint8()? != 0"),
    };
    format!("if {read_flag} {{ Some({inner}) }} else {{ None }}")
}

fn decode_back_reference(b: &BackRefSpec, dec_var: &str) -> String {
    let read_word = match b.storage_width {
        StorageWidth::Uint8 => format!("{dec_var}.read_uint8()? as u64"),
        StorageWidth::Uint16 => format!("{dec_var}.read_uint16({})? as u64", endianness_expr(b.endianness)),
        StorageWidth::Uint32 => format!("{dec_var}.read_uint32({})? as u64", endianness_expr(b.endianness)),
    };
    let tag = b.storage_width.pointer_tag_mask();
    let mask = b.offset_mask;
    let base = match b.offset_base {
        crate::schema::OffsetBase::MessageStart => "__offset".to_string(),
        crate::schema::OffsetBase::CurrentPosition => format!("{dec_var}.byte_offset()? + __offset"),
    };
    let target = mangle(&b.target);
    format!(
        "{{
    let __raw = {read_word};
    let __pointed = __raw & {tag}u64 == {tag}u64;
    let __offset = __raw & {mask}u64;
    if __pointed {{
        let __seek_to = {base};
        {dec_var}.enter_back_reference(__seek_to)?;
        {dec_var}.push_position()?;
        {dec_var}.seek(__seek_to)?;
        let __value = {target}::decode({dec_var})?;
        {dec_var}.pop_position()?;
        {dec_var}.exit_back_reference(__seek_to);
        __value
    }} else {{
        {target}::decode({dec_var})?
    }}
}}"
    )
}

fn decode_discriminated_union(
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    u: &DiscriminatedUnionDescriptor,
    dec_var: &str,
) -> String {
    let enum_name = format!("{}_{}", mangle(type_name), mangle_field(field_name));
    let peek_expr = match &u.discriminator {
        DiscriminatorSpec::Peek { width, endianness } => match width {
            PrimitiveWidth::Uint8 => format!("{dec_var}.peek_uint8()? as u64"),
            PrimitiveWidth::Uint16 => format!("{dec_var}.peek_uint16({})? as u64", endianness_expr(*endianness)),
            PrimitiveWidth::Uint32 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
            PrimitiveWidth::Uint64 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
        },
        DiscriminatorSpec::Field { field_name: src } => format!("{} as u64", field_ident(src)),
    };
    // `when` predicates on a peek-sourced discriminator only ever name
    // `value`; a field-sourced one names the field directly (see the
    // `message_type == 1` shape), so bind both to the same discriminant.
    let ctx_expr = match &u.discriminator {
        DiscriminatorSpec::Field { field_name: src } => {
            format!("&expr::FieldContext(&[(\"value\", __disc as i64), (\"{src}\", __disc as i64)])")
        }
        DiscriminatorSpec::Peek { .. } => {
            "&expr::FieldContext(&[(\"value\", __disc as i64)])".to_string()
        }
    };
    let mut arms = String::new();
    for (idx, v) in u.variants.iter().enumerate() {
        let variant = mangle_field(&v.target);
        let target = mangle(&v.target);
        match &v.when {
            Some(_) => {
                let key = (type_name.to_string(), field_name.to_string(), idx);
                let cond_src = v.when.clone().unwrap_or_default();
                let _ = plan.variant_whens.get(&key);
                let _ = writeln!(
                    arms,
                    "    if expr::eval_truthy(&{{ static E: std::sync::OnceLock<expr::Expr> = std::sync::OnceLock::new(); E.get_or_init(|| expr::parse({cond_src:?}).expect(\"when predicate parsed at plan time\")).clone() }}, {ctx_expr}) {{",
                );
                let _ = writeln!(arms, "        {enum_name}::{variant}({target}::decode({dec_var})?)");
                let _ = writeln!(arms, "    }} else");
            }
            None => {
                let _ = writeln!(arms, "    {{ {enum_name}::{variant}({target}::decode({dec_var})?) }}");
            }
        }
    }
    format!(
        "{{
    let __disc = {peek_expr};
{arms}
}}"
    )
}

fn decode_choice(plan: &Plan, type_name: &str, field_name: &str, c: &ChoiceDescriptor, dec_var: &str) -> String {
    let enum_name = format!("{}_{}", mangle(type_name), mangle_field(field_name));
    let width = c.discriminant_type.unwrap_or(PrimitiveWidth::Uint8);
    let peek_expr = match width {
        PrimitiveWidth::Uint8 => format!("{dec_var}.peek_uint8()? as u64"),
        PrimitiveWidth::Uint16 => format!("{dec_var}.peek_uint16(Endianness::Big)? as u64"),
        _ => format!("{dec_var}.peek_uint8()? as u64"),
    };
    let mut arms = String::new();
    for (idx, v) in c.choices.iter().enumerate() {
        let variant = mangle_field(&v.target);
        let target = mangle(&v.target);
        let tag = v.tag.unwrap_or((idx + 1) as u64);
        let _ = writeln!(arms, "    {tag}u64 => {enum_name}::{variant}({target}::decode({dec_var})?),");
    }
    let _ = plan;
    format!(
        "{{
    let __tag = {peek_expr};
    match __tag {{
{arms}
        other => return Err(DecodeError::UnknownDiscriminator(other)),
    }}
}}"
    )
}

fn decode_array(
    plan: &Plan,
    type_name: &str,
    field_name: &str,
    a: &ArrayDescriptor,
    dec_var: &str,
    end: Endianness,
) -> String {
    let item_expr = decode_descriptor_expr(plan, type_name, field_name, &a.items, dec_var, end);
    // Position tables for `first<T>`/`last<T>`/`corresponding<T>` only matter
    // while re-encoding: the decoder hands back plain decoded values, and a
    // decoded `position_of`-style field is read verbatim rather than
    // resolved, so there is no decode-side bookkeeping to emit here.
    let record_stmt = "";
    match &a.kind {
        ArrayKind::Fixed { length } => format!(
            "{{
    let mut __v = Vec::with_capacity({length} as usize);
    for _ in 0..{length} {{
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}"
        ),
        ArrayKind::LengthPrefixed { length_type } => {
            let read_len = match length_type {
                PrimitiveWidth::Uint8 => format!("{dec_var}.read_uint8()? as u64"),
                PrimitiveWidth::Uint16 => format!("{dec_var}.read_uint16({})? as u64", endianness_expr(Some(end))),
                PrimitiveWidth::Uint32 => format!("{dec_var}.read_uint32({})? as u64", endianness_expr(Some(end))),
                PrimitiveWidth::Uint64 => format!("{dec_var}.read_uint64({})?", endianness_expr(Some(end))),
            };
            format!(
                "{{
    let __len = {read_len};
    let mut __v = Vec::with_capacity(__len as usize);
    for _ in 0..__len {{
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}"
            )
        }
        ArrayKind::LengthPrefixedItems { length_type, .. } => {
            let read_len = match length_type {
                PrimitiveWidth::Uint8 => format!("{dec_var}.read_uint8()? as u64"),
                PrimitiveWidth::Uint16 => format!("{dec_var}.read_uint16({})? as u64", endianness_expr(Some(end))),
                PrimitiveWidth::Uint32 => format!("{dec_var}.read_uint32({})? as u64", endianness_expr(Some(end))),
                PrimitiveWidth::Uint64 => format!("{dec_var}.read_uint64({})?", endianness_expr(Some(end))),
            };
            let item_end = endianness_expr(Some(end));
            format!(
                "{{
    let __len = {read_len};
    let mut __v = Vec::with_capacity(__len as usize);
    for _ in 0..__len {{
        let _item_len = {dec_var}.read_uint32({item_end})?;
        __v.push({item_expr});
    }}
    __v
}}"
            )
        }
        ArrayKind::FieldReferenced { length_field } => format!(
            "{{
    let __len = {} as u64;
    let mut __v = Vec::with_capacity(__len as usize);
    for _ in 0..__len {{
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}",
            sibling_decoded_local(plan, type_name, length_field)
        ),
        ArrayKind::NullTerminated { .. } => format!(
            "{{
    let mut __v = Vec::new();
    loop {{
        if {dec_var}.peek_uint8()? == 0 {{
            let _ = {dec_var}.read_uint8()?;
            break;
        }}
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}"
        ),
        ArrayKind::SignatureTerminated {
            terminator_value,
            terminator_type,
            endianness,
        } => {
            let peek_term = match terminator_type {
                PrimitiveWidth::Uint8 => format!("{dec_var}.peek_uint8()? as u64"),
                PrimitiveWidth::Uint16 => format!("{dec_var}.peek_uint16({})? as u64", endianness_expr(*endianness)),
                PrimitiveWidth::Uint32 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
                PrimitiveWidth::Uint64 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
            };
            format!(
                "{{
    let mut __v = Vec::new();
    loop {{
        if {peek_term} == {terminator_value}u64 {{
            break;
        }}
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}"
            )
        }
        ArrayKind::EofTerminated => format!(
            "{{
    let mut __v = Vec::new();
    while {dec_var}.has_more()? {{
        __v.push({item_expr});
        {record_stmt}
    }}
    __v
}}"
        ),
    }
}

fn decode_string(plan: &Plan, type_name: &str, s: &StringDescriptor, dec_var: &str) -> String {
    let s = s.clone().canonicalize();
    let decode_bytes = |body: &str| -> String {
        match s.encoding {
            StringEncoding::Utf8 => format!("String::from_utf8({body}).unwrap_or_default()"),
            StringEncoding::Ascii => format!("{body}.into_iter().map(|b| b as char).collect::<String>()"),
        }
    };
    match &s.kind {
        ArrayKind::Fixed { length } => {
            let body = format!(
                "{{
    let mut __b = Vec::with_capacity({length} as usize);
    for _ in 0..{length} {{
        let byte = {dec_var}.read_uint8()?;
        if byte != 0 {{ __b.push(byte); }}
    }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::LengthPrefixed { length_type } => {
            let read_len = match length_type {
                PrimitiveWidth::Uint8 => format!("{dec_var}.read_uint8()? as u64"),
                PrimitiveWidth::Uint16 => format!("{dec_var}.read_uint16(Endianness::Big)? as u64"),
                PrimitiveWidth::Uint32 => format!("{dec_var}.read_uint32(Endianness::Big)? as u64"),
                PrimitiveWidth::Uint64 => format!("{dec_var}.read_uint64(Endianness::Big)?"),
            };
            let body = format!(
                "{{
    let __len = {read_len};
    let mut __b = Vec::with_capacity(__len as usize);
    for _ in 0..__len {{ __b.push({dec_var}.read_uint8()?); }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::NullTerminated { .. } => {
            let body = format!(
                "{{
    let mut __b = Vec::new();
    loop {{
        let byte = {dec_var}.read_uint8()?;
        if byte == 0 {{ break; }}
        __b.push(byte);
    }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::EofTerminated => {
            let body = format!(
                "{{
    let mut __b = Vec::new();
    while {dec_var}.has_more()? {{ __b.push({dec_var}.read_uint8()?); }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::SignatureTerminated {
            terminator_value,
            terminator_type,
            endianness,
        } => {
            let peek_term = match terminator_type {
                PrimitiveWidth::Uint8 => format!("{dec_var}.peek_uint8()? as u64"),
                PrimitiveWidth::Uint16 => format!("{dec_var}.peek_uint16({})? as u64", endianness_expr(*endianness)),
                PrimitiveWidth::Uint32 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
                PrimitiveWidth::Uint64 => format!("{dec_var}.peek_uint32({})? as u64", endianness_expr(*endianness)),
            };
            let body = format!(
                "{{
    let mut __b = Vec::new();
    loop {{
        if {peek_term} == {terminator_value}u64 {{ break; }}
        __b.push({dec_var}.read_uint8()?);
    }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::FieldReferenced { length_field } => {
            let sibling = sibling_decoded_local(plan, type_name, length_field);
            let body = format!(
                "{{
    let __len = {sibling} as u64;
    let mut __b = Vec::with_capacity(__len as usize);
    for _ in 0..__len {{ __b.push({dec_var}.read_uint8()?); }}
    __b
}}"
            );
            decode_bytes(&body)
        }
        ArrayKind::LengthPrefixedItems { .. } => "String::new() /* unsupported for strings */".to_string(),
    }
}

// ---------------------------------------------------------------------
// Lazy position-field (instance) wrappers
// ---------------------------------------------------------------------

fn emit_instance_wrapper(out: &mut String, plan: &Plan, type_name: &str, c: &Composite) {
    let schema = &plan.schema;
    let ty = mangle(type_name);
    let wrapper = format!("{ty}WithInstances");
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "/// Wraps [`{ty}`] plus cached lazy position-field accessors."
    );
    let _ = writeln!(out, "pub struct {wrapper}<'a> {{");
    let _ = writeln!(out, "    pub eager: {ty},");
    let _ = writeln!(out, "    root: &'a [u8],");
    let _ = writeln!(out, "    bit_order: BitOrder,");
    for inst in &c.instances {
        let ident = field_ident(&inst.name);
        let inst_ty = mangle(&inst.target_type);
        let _ = writeln!(out, "    __cache_{ident}: std::cell::OnceCell<{inst_ty}>,");
    }
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "impl<'a> {wrapper}<'a> {{");
    let _ = writeln!(
        out,
        "    pub fn new(eager: {ty}, root: &'a [u8], bit_order: BitOrder) -> Self {{"
    );
    let _ = writeln!(out, "        Self {{");
    let _ = writeln!(out, "            eager,");
    let _ = writeln!(out, "            root,");
    let _ = writeln!(out, "            bit_order,");
    for inst in &c.instances {
        let _ = writeln!(out, "            __cache_{}: std::cell::OnceCell::new(),", field_ident(&inst.name));
    }
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);

    for inst in &c.instances {
        let ident = field_ident(&inst.name);
        let inst_ty = mangle(&inst.target_type);
        let _ = writeln!(
            out,
            "    /// Resolves `{}` on first access; subsequent calls return the cached value.",
            inst.name
        );
        let _ = writeln!(
            out,
            "    pub fn {ident}(&self) -> Result<&{inst_ty}, LazyEvalError> {{"
        );
        let _ = writeln!(out, "        if let Some(v) = self.__cache_{ident}.get() {{ return Ok(v); }}");
        let offset_expr = match &inst.position {
            PositionExpr::Absolute(n) if *n >= 0 => format!("{n}u64"),
            PositionExpr::Absolute(n) => format!("(self.root.len() as i64 + {n}) as u64"),
            PositionExpr::FieldRef(raw) => {
                match bare_field_name(&TargetPath::parse(raw).unwrap_or(TargetPath {
                    root: PathRoot::Local,
                    ups: 0,
                    steps: vec![],
                })) {
                    Some(name) => format!("self.eager.{} as u64", field_ident(&name)),
                    None => "0u64".to_string(),
                }
            }
        };
        let _ = writeln!(out, "        let __offset = {offset_expr};");
        if let Some(align) = inst.align {
            let _ = writeln!(
                out,
                "        if __offset % {align} != 0 {{ return Err(LazyEvalError::UnresolvedPosition {{ field: \"{}\".into(), target: \"alignment {} violated\".into() }}); }}",
                inst.name, align
            );
        }
        let _ = writeln!(out, "        let mut __dec = Decoder::new(self.root, self.bit_order);");
        let _ = writeln!(
            out,
            "        __dec.seek(__offset).map_err(|_| LazyEvalError::UnresolvedPosition {{ field: \"{}\".into(), target: \"{}\".into() }})?;",
            inst.name, inst.target_type
        );
        let _ = writeln!(
            out,
            "        let __value = {inst_ty}::decode(&mut __dec).map_err(|_| LazyEvalError::UnresolvedPosition {{ field: \"{}\".into(), target: \"{}\".into() }})?;",
            inst.name, inst.target_type
        );
        let _ = writeln!(out, "        Ok(self.__cache_{ident}.get_or_init(|| __value))");
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "}}");
    let _ = schema;
}
