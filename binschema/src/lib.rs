//! `binschema`: a declarative binary wire-format codec generator.
//!
//! Given a [`schema`] — a closed vocabulary of type descriptors describing a
//! binary wire format — this crate plans ([`planner`]) and emits
//! ([`emitter`]) Rust source for encoders/decoders that call into the
//! low-level [`bitstream`] runtime at bit-level precision.
//!
//! Dependency direction: [`bitstream`] depends on nothing else in this
//! crate; [`schema`] is the data model; [`planner`] depends on [`schema`];
//! [`emitter`] depends on [`planner`] and [`schema`].

pub mod bitstream;
pub mod crc32;
pub mod diag;
pub mod emitter;
pub mod error;
pub mod expr;
pub mod planner;
pub mod schema;

pub use error::{LazyEvalError, PlanError, PlanErrors, SchemaError};
pub use schema::Schema;

/// Plans and emits Rust source for `schema` in one call — the common entry
/// point for a CLI or build-script front-end.
pub fn generate(schema: &Schema) -> Result<String, PlanErrors> {
    let plan = planner::plan(schema)?;
    Ok(emitter::generate(&plan))
}

/// End-to-end coverage of `Schema::from_yaml` → [`planner::plan`] →
/// [`emitter::generate`] against representative wire formats. Generated
/// source calls back into this crate's runtime but is never itself
/// compiled here — these tests assert on the emitted text's shape, the
/// same surface a hand-reviewer would check before trusting the output.
#[cfg(test)]
mod integration_tests {
    use super::*;

    fn generate_yaml(yaml: &str) -> String {
        let schema = Schema::from_yaml(yaml).unwrap();
        generate(&schema).unwrap()
    }

    #[test]
    fn fixed_record_round_trip_shape() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            config:
              default_endianness: big
            types:
              SensorReading:
                fields:
                  - name: device_id
                    kind: uint16
                  - name: temperature
                    kind: float32
                  - name: humidity
                    kind: uint8
                  - name: timestamp
                    kind: uint32
            "#,
        );
        assert!(out.contains("pub struct SensorReading {"));
        assert!(out.contains("pub device_id: u16,"));
        assert!(out.contains("pub temperature: f32,"));
        assert!(out.contains("pub humidity: u8,"));
        assert!(out.contains("pub timestamp: u32,"));
        assert!(out.contains("pub fn encode(&self, enc: &mut Encoder)"));
        assert!(out.contains("pub fn decode(dec: &mut Decoder)"));
    }

    #[test]
    fn length_prefixed_string_alias_shape() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            types:
              S:
                kind: string
                array_kind: length_prefixed
                length_type: uint8
                encoding: utf8
            "#,
        );
        assert!(out.contains("pub type S = String;"));
        assert!(out.contains("pub fn encode_s(value: &S, enc: &mut Encoder)"));
        assert!(out.contains("pub fn decode_s(dec: &mut Decoder)"));
        assert!(out.contains("write_uint8"));
    }

    #[test]
    fn peek_based_union_emits_discriminated_enum_and_dispatch() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            types:
              Pointer:
                fields:
                  - name: offset
                    kind: uint16
              Direct:
                fields:
                  - name: length
                    kind: uint8
                  - name: data
                    kind: array
                    array_kind: fixed
                    length: 5
                    items: { kind: uint8 }
              Frame:
                fields:
                  - name: value
                    kind: discriminated_union
                    discriminator:
                      source: peek
                      width: uint8
                    variants:
                      - when: "value >= 0xC0"
                        target: Pointer
                      - target: Direct
            "#,
        );
        assert!(out.contains("pub enum Frame_value {"));
        assert!(out.contains("Pointer(Pointer),"));
        assert!(out.contains("Direct(Direct),"));
        assert!(out.contains("__v.encode(enc)?;"));
    }

    #[test]
    fn field_based_union_with_fallback_dispatches_on_sibling() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            types:
              Login:
                fields:
                  - name: user_id
                    kind: uint32
              Message:
                fields:
                  - name: body
                    kind: uint32
              Raw:
                fields:
                  - name: bytes
                    kind: uint32
              Frame:
                fields:
                  - name: message_type
                    kind: uint8
                  - name: payload
                    kind: discriminated_union
                    discriminator:
                      source: field
                      field_name: message_type
                    variants:
                      - when: "message_type == 1"
                        target: Login
                      - when: "message_type == 2"
                        target: Message
                      - target: Raw
            "#,
        );
        assert!(out.contains("pub enum Frame_payload {"));
        assert!(out.contains("Login(Login),"));
        assert!(out.contains("Message(Message),"));
        assert!(out.contains("Raw(Raw),"));
        // the discriminator field decodes into its own local before the
        // union dispatch expression reads it back.
        assert!(out.contains("let message_type"));
    }

    #[test]
    fn back_reference_round_trip_shape() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            types:
              Name:
                fields:
                  - name: len
                    kind: uint8
              Frame:
                fields:
                  - name: name
                    kind: back_reference
                    storage_width: uint16
                    offset_mask: "0x3FFF"
                    offset_base: message_start
                    target: Name
            "#,
        );
        assert!(out.contains("pub struct Frame {"));
        assert!(out.contains("pub name: Name,"));
        assert!(out.contains("dict_lookup") || out.contains("dict_record"));
    }

    #[test]
    fn lazy_instance_field_emits_wrapper_with_cached_accessor() {
        let out = generate_yaml(
            r#"
            version: '1.0'
            types:
              Footer:
                fields:
                  - name: magic
                    kind: uint32
              Container:
                fields:
                  - name: body
                    kind: uint32
                instances:
                  - name: footer
                    type: Footer
                    position: -22
            "#,
        );
        assert!(out.contains("pub struct ContainerWithInstances"));
        assert!(out.contains("OnceCell") || out.contains("once_cell"));
        assert!(out.contains("footer"));
    }
}
