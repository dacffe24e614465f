//! # Codegen Planner
//!
//! Turns a validated [`Schema`] into a [`Plan`]: the schema itself (kept
//! around so the emitter can walk the original descriptor tree) plus a set
//! of precomputed side tables the emitter would otherwise have to
//! recompute at every use site:
//!
//! - which types actually need their own emitted encode/decode functions,
//!   in declaration order (templates and trivial non-array/string aliases
//!   are inlined at their use sites instead, see [`Schema::is_alias`]),
//! - parsed [`Expr`] ASTs for every `conditional` field and `when` variant
//!   predicate, keyed by where they appear,
//! - parsed [`TargetPath`]s for every computed field and field-referenced
//!   instance position, and
//! - which array fields need per-item position-table bookkeeping in the
//!   generated encoder/decoder, because some computed field somewhere in
//!   the schema indexes into them with `first<T>`/`last<T>`/`corresponding<T>`.
//!
//! Planning is a single pass that accumulates every [`PlanError`] it finds
//! rather than stopping at the first, the same shape as
//! [`crate::error::PlanErrors`] advertises.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{PlanError, PlanErrors};
use crate::expr::{self, Expr};
use crate::schema::{
    ArrayKind, ChoiceDescriptor, Composite, ComputedSpec, Descriptor, DiscriminatedUnionDescriptor,
    DiscriminatorSpec, Field, Instance, OptionalDescriptor, PathStep, PositionExpr, Schema,
    Selector, StringDescriptor, TargetPath, TypeDef,
};

pub struct Plan {
    pub schema: Schema,
    /// Declaration-order names of types that get their own emitted
    /// encode/decode function pair.
    pub emission_order: Vec<String>,
    /// `(type_name, field_name) -> parsed conditional expression`.
    pub conditions: FxHashMap<(String, String), Expr>,
    /// `(type_name, field_name, variant_index) -> parsed `when` predicate`.
    pub variant_whens: FxHashMap<(String, String, usize), Expr>,
    /// `(type_name, field_name) -> parsed computed-field target path(s)`,
    /// one entry except `sum_of_sizes`, which carries every summand.
    pub computed_targets: FxHashMap<(String, String), Vec<TargetPath>>,
    /// `(type_name, instance_name) -> parsed position path`, present only
    /// when the instance's `position` is a field reference rather than a
    /// bare absolute offset.
    pub instance_targets: FxHashMap<(String, String), TargetPath>,
    /// `array_field_name -> item type names` that need position-table
    /// bookkeeping because some `first<T>`/`last<T>`/`corresponding<T>`
    /// selector in the schema indexes into that field. Keyed on the bare
    /// field name rather than `(type, field)`: selectors can reach an
    /// array field through `_root.`/`../` walks the planner does not fully
    /// resolve, so tracking is deliberately over-approximate — see
    /// DESIGN.md.
    pub tracked_arrays: FxHashMap<String, FxHashSet<String>>,
}

struct Ctx<'s> {
    schema: &'s Schema,
    errors: Vec<PlanError>,
    declared_array_fields: FxHashSet<String>,
    tracked_arrays: FxHashMap<String, FxHashSet<String>>,
    conditions: FxHashMap<(String, String), Expr>,
    variant_whens: FxHashMap<(String, String, usize), Expr>,
    computed_targets: FxHashMap<(String, String), Vec<TargetPath>>,
    instance_targets: FxHashMap<(String, String), TargetPath>,
}

pub fn plan(schema: &Schema) -> Result<Plan, PlanErrors> {
    let mut ctx = Ctx {
        schema,
        errors: Vec::new(),
        declared_array_fields: collect_array_field_names(schema),
        tracked_arrays: FxHashMap::default(),
        conditions: FxHashMap::default(),
        variant_whens: FxHashMap::default(),
        computed_targets: FxHashMap::default(),
        instance_targets: FxHashMap::default(),
    };

    let mut emission_order = Vec::new();
    for (name, type_def) in &schema.types {
        if Schema::is_template(name) {
            continue;
        }
        if !Schema::is_alias(type_def) {
            emission_order.push(name.clone());
        }
        match type_def {
            TypeDef::Composite(composite) => ctx.validate_composite(name, composite),
            TypeDef::Alias(descriptor) => ctx.validate_descriptor_refs(name, "<alias>", descriptor),
        }
    }

    if ctx.errors.is_empty() {
        Ok(Plan {
            schema: schema.clone(),
            emission_order,
            conditions: ctx.conditions,
            variant_whens: ctx.variant_whens,
            computed_targets: ctx.computed_targets,
            instance_targets: ctx.instance_targets,
            tracked_arrays: ctx.tracked_arrays,
        })
    } else {
        Err(PlanErrors(ctx.errors))
    }
}

fn collect_array_field_names(schema: &Schema) -> FxHashSet<String> {
    let mut names = FxHashSet::default();
    for type_def in schema.types.values() {
        if let TypeDef::Composite(c) = type_def {
            for field in &c.fields {
                if matches!(field.descriptor, Descriptor::Array(_) | Descriptor::String(_)) {
                    names.insert(field.name.clone());
                }
            }
        }
    }
    names
}

impl<'s> Ctx<'s> {
    fn validate_composite(&mut self, type_name: &str, composite: &Composite) {
        let mut seen_fields: Vec<&str> = Vec::new();
        for field in &composite.fields {
            self.validate_field(type_name, field, &seen_fields);
            seen_fields.push(&field.name);
        }
        for instance in &composite.instances {
            self.validate_instance(type_name, instance);
        }
    }

    fn validate_field(&mut self, type_name: &str, field: &Field, preceding: &[&str]) {
        if let Some(cond) = &field.conditional {
            match expr::parse(cond) {
                Ok(parsed) => {
                    self.conditions
                        .insert((type_name.to_string(), field.name.clone()), parsed);
                }
                Err(e) => self.errors.push(PlanError::MalformedComputedTarget {
                    type_name: type_name.to_string(),
                    field: field.name.clone(),
                    reason: format!("conditional expression: {e}"),
                }),
            }
        }

        if let Some(computed) = &field.computed {
            self.validate_computed(type_name, &field.name, computed);
        }

        self.validate_descriptor_refs(type_name, &field.name, &field.descriptor);

        match &field.descriptor {
            Descriptor::DiscriminatedUnion(u) => {
                self.validate_union(type_name, &field.name, u, preceding)
            }
            Descriptor::Choice(c) => self.validate_choice(type_name, &field.name, c),
            Descriptor::Array(a) => {
                if let ArrayKind::NullTerminated {
                    terminal_variants: Some(variants),
                } = &a.kind
                {
                    for variant in variants {
                        self.require_type(type_name, &field.name, variant, |v| {
                            PlanError::UnknownTerminalVariant {
                                type_name: v.0.to_string(),
                                field: v.1.to_string(),
                                variant: v.2.to_string(),
                            }
                        });
                    }
                }
            }
            _ => {}
        }
    }

    fn validate_instance(&mut self, type_name: &str, instance: &Instance) {
        self.require_type_exists(type_name, &instance.name, &instance.target_type);
        if let Some(align) = instance.align {
            if !align.is_power_of_two() {
                self.errors.push(PlanError::InvalidAlignment {
                    type_name: type_name.to_string(),
                    field: instance.name.clone(),
                    align,
                });
            }
        }
        if let PositionExpr::FieldRef(raw) = &instance.position {
            match TargetPath::parse(raw) {
                Ok(path) => {
                    self.track_selectors(type_name, &instance.name, &path);
                    self.instance_targets
                        .insert((type_name.to_string(), instance.name.clone()), path);
                }
                Err(reason) => self.errors.push(PlanError::MalformedComputedTarget {
                    type_name: type_name.to_string(),
                    field: instance.name.clone(),
                    reason,
                }),
            }
        }
    }

    fn validate_computed(&mut self, type_name: &str, field_name: &str, computed: &ComputedSpec) {
        let raw_targets: Vec<&str> = match computed {
            ComputedSpec::LengthOf { target, .. } => vec![target.as_str()],
            ComputedSpec::Crc32Of { target } => vec![target.as_str()],
            ComputedSpec::PositionOf { target } => vec![target.as_str()],
            ComputedSpec::SumOfSizes { targets } => targets.iter().map(|t| t.as_str()).collect(),
            ComputedSpec::SumOfTypeSizes { array, .. } => vec![array.as_str()],
        };
        let mut parsed = Vec::with_capacity(raw_targets.len());
        for raw in raw_targets {
            match TargetPath::parse(raw) {
                Ok(path) => {
                    self.track_selectors(type_name, field_name, &path);
                    parsed.push(path);
                }
                Err(reason) => self.errors.push(PlanError::MalformedComputedTarget {
                    type_name: type_name.to_string(),
                    field: field_name.to_string(),
                    reason,
                }),
            }
        }
        if !parsed.is_empty() {
            self.computed_targets
                .insert((type_name.to_string(), field_name.to_string()), parsed);
        }
        if let ComputedSpec::SumOfTypeSizes { element_type, .. } = computed {
            self.require_type(type_name, field_name, element_type, |v| PlanError::UnknownType {
                referrer: format!("{}.{}", v.0, v.1),
                target: v.2.to_string(),
            });
        }
    }

    /// Records every indexed selector in `path` against [`Ctx::tracked_arrays`],
    /// and flags a selector over an array field this schema never declares.
    fn track_selectors(&mut self, type_name: &str, field_name: &str, path: &TargetPath) {
        for step in &path.steps {
            if let PathStep::Indexed {
                array_field,
                selector,
            } = step
            {
                let item_type = match selector {
                    Selector::First(t) | Selector::Last(t) | Selector::Corresponding(t) => t,
                };
                if !self.declared_array_fields.contains(array_field) {
                    self.errors.push(PlanError::CorrespondingOutsideArray(
                        item_type.clone(),
                        type_name.to_string(),
                        field_name.to_string(),
                    ));
                    continue;
                }
                self.tracked_arrays
                    .entry(array_field.clone())
                    .or_default()
                    .insert(item_type.clone());
            }
        }
    }

    fn validate_union(
        &mut self,
        type_name: &str,
        field_name: &str,
        union: &DiscriminatedUnionDescriptor,
        preceding: &[&str],
    ) {
        if let DiscriminatorSpec::Field { field_name: src } = &union.discriminator {
            if !preceding.contains(&src.as_str()) {
                self.errors.push(PlanError::MalformedComputedTarget {
                    type_name: type_name.to_string(),
                    field: field_name.to_string(),
                    reason: format!(
                        "field-sourced discriminator `{src}` must name an earlier field in the same type"
                    ),
                });
            }
        }
        let mut saw_fallback = false;
        for (idx, variant) in union.variants.iter().enumerate() {
            self.require_type_exists(type_name, field_name, &variant.target);
            match &variant.when {
                Some(when) => match expr::parse(when) {
                    Ok(parsed) => {
                        self.variant_whens
                            .insert((type_name.to_string(), field_name.to_string(), idx), parsed);
                    }
                    Err(e) => self.errors.push(PlanError::MalformedComputedTarget {
                        type_name: type_name.to_string(),
                        field: field_name.to_string(),
                        reason: format!("variant `when` predicate: {e}"),
                    }),
                },
                None => saw_fallback = true,
            }
        }
        if !saw_fallback && !union.variants.is_empty() {
            self.errors.push(PlanError::MalformedComputedTarget {
                type_name: type_name.to_string(),
                field: field_name.to_string(),
                reason: "discriminated_union has no fallback variant (one `when` must be omitted)"
                    .to_string(),
            });
        }
    }

    fn validate_choice(&mut self, type_name: &str, field_name: &str, choice: &ChoiceDescriptor) {
        for variant in &choice.choices {
            self.require_type_exists(type_name, field_name, &variant.target);
        }
    }

    fn validate_descriptor_refs(&mut self, type_name: &str, field_name: &str, d: &Descriptor) {
        match d {
            Descriptor::TypeRef(r) => {
                let full = if r.type_args.is_empty() {
                    r.name.clone()
                } else {
                    format!("{}<{}>", r.name, r.type_args.join(","))
                };
                self.require_type_exists(type_name, field_name, &full);
            }
            Descriptor::Array(a) => self.validate_descriptor_refs(type_name, field_name, &a.items),
            Descriptor::String(StringDescriptor { .. }) => {}
            Descriptor::Optional(OptionalDescriptor { value_type, .. }) => {
                self.validate_descriptor_refs(type_name, field_name, value_type)
            }
            Descriptor::DiscriminatedUnion(u) => {
                for v in &u.variants {
                    self.require_type_exists(type_name, field_name, &v.target);
                }
            }
            Descriptor::Choice(c) => {
                for v in &c.choices {
                    self.require_type_exists(type_name, field_name, &v.target);
                }
            }
            Descriptor::BackReference(b) => {
                self.require_type_exists(type_name, field_name, &b.target);
            }
            _ => {}
        }
    }

    fn require_type_exists(&mut self, type_name: &str, field_name: &str, target: &str) {
        self.require_type(type_name, field_name, target, |v| PlanError::UnknownType {
            referrer: format!("{}.{}", v.0, v.1),
            target: v.2.to_string(),
        });
    }

    fn require_type(
        &mut self,
        type_name: &str,
        field_name: &str,
        target: &str,
        make_err: impl FnOnce((&str, &str, &str)) -> PlanError,
    ) {
        if self.schema.resolve_template(target).is_err() {
            self.errors.push(make_err((type_name, field_name, target)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(yaml: &str) -> Schema {
        Schema::from_yaml(yaml).unwrap()
    }

    #[test]
    fn emission_order_skips_templates_and_trivial_aliases() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Raw:
                kind: uint32
              "Optional<T>":
                kind: optional
                value_type: { kind: type_ref, name: T }
              Frame:
                fields:
                  - name: len
                    kind: uint32
            "#,
        );
        let p = plan(&s).unwrap();
        assert_eq!(p.emission_order, vec!["Frame".to_string()]);
    }

    #[test]
    fn unknown_type_reference_is_reported() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Frame:
                fields:
                  - name: body
                    kind: type_ref
                    name: Missing
            "#,
        );
        let err = plan(&s).unwrap_err();
        assert_eq!(err.0.len(), 1);
        assert!(matches!(err.0[0], PlanError::UnknownType { .. }));
    }

    #[test]
    fn conditional_expression_is_parsed_and_cached() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Frame:
                fields:
                  - name: flags
                    kind: uint8
                  - name: extra
                    kind: uint32
                    conditional: "flags & 1 == 1"
            "#,
        );
        let p = plan(&s).unwrap();
        assert!(p.conditions.contains_key(&("Frame".to_string(), "extra".to_string())));
    }

    #[test]
    fn malformed_conditional_is_a_plan_error() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Frame:
                fields:
                  - name: flags
                    kind: uint8
                  - name: extra
                    kind: uint32
                    conditional: "flags &"
            "#,
        );
        assert!(plan(&s).is_err());
    }

    #[test]
    fn field_discriminator_must_reference_earlier_field() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Header:
                kind: uint8
              Frame:
                fields:
                  - name: payload
                    kind: discriminated_union
                    discriminator:
                      source: field
                      field_name: tag
                    variants:
                      - target: Header
            "#,
        );
        let err = plan(&s).unwrap_err();
        assert!(err
            .0
            .iter()
            .any(|e| matches!(e, PlanError::MalformedComputedTarget { .. })));
    }

    #[test]
    fn corresponding_selector_over_undeclared_array_is_rejected() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Chunk:
                kind: uint32
              Frame:
                fields:
                  - name: marker
                    kind: uint32
                    computed:
                      op: position_of
                      target: "items[corresponding<Chunk>]"
            "#,
        );
        let err = plan(&s).unwrap_err();
        assert!(err
            .0
            .iter()
            .any(|e| matches!(e, PlanError::CorrespondingOutsideArray(..))));
    }

    #[test]
    fn corresponding_selector_over_declared_array_is_tracked() {
        let s = schema(
            r#"
            version: '1.0'
            types:
              Chunk:
                kind: uint32
              Frame:
                fields:
                  - name: items
                    kind: array
                    array_kind: fixed
                    length: 4
                    items: { kind: type_ref, name: Chunk }
                  - name: marker
                    kind: uint32
                    computed:
                      op: position_of
                      target: "items[corresponding<Chunk>]"
            "#,
        );
        let p = plan(&s).unwrap();
        assert!(p.tracked_arrays["items"].contains("Chunk"));
    }
}
