//! # Bit Stream Runtime (BSR)
//!
//! The low-level reader/writer pair that generated encoders/decoders call
//! into. Two dual objects: [`Encoder`] appends bits/bytes to a growing
//! buffer; [`Decoder`] consumes them from a borrowed byte slice. Both
//! support bit-packed values (1–64 bits) under a runtime-selectable
//! [`crate::schema::BitOrder`], byte-aligned multi-byte integers under a
//! runtime-selectable [`crate::schema::Endianness`], floats, variable-length
//! integers (DER, LEB128, EBML), non-consuming peeks, absolute seeks, and a
//! bounded position save/restore stack (cap 128).
//!
//! Save/seek/restore over `bitstream_io::BitReader` underlies position
//! tracking; bit order and endianness are runtime-selected (rather than a
//! compile-time type parameter) since one schema can mix both across fields.

mod decoder;
mod encoder;
pub mod varint;

pub use decoder::Decoder;
pub use encoder::Encoder;

use thiserror::Error;

/// Hard cap on the nested position-save stack: a DoS guard
/// against adversarially deep back-reference / instance-field chains.
pub const MAX_POSITION_STACK: usize = 128;

/// Faults generated **encode** code can raise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("bit size {0} is out of range 1..=64")]
    InvalidBitSize(u32),
    #[error("computed field `{0}` was supplied by the caller (computed fields are write-only)")]
    ComputedFieldSupplied(String),
    #[error("unknown variant tag `{0}` for discriminated union")]
    UnknownVariantTag(String),
    #[error(
        "item of length {actual} exceeds the maximum representable by `{length_type}` ({max})"
    )]
    OversizeItemLength {
        actual: u64,
        max: u64,
        length_type: &'static str,
    },
    #[error("`corresponding<{0}>` used outside of an array iteration context")]
    CorrespondingOutsideArray(String),
}

/// Faults generated **decode** code can raise.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of stream at byte offset {0}")]
    UnexpectedEof(u64),
    #[error("unknown discriminator value: 0x{0:x}")]
    UnknownDiscriminator(u64),
    #[error("missing field-referenced length for field `{0}`")]
    MissingLength(String),
    #[error("circular back-reference at offset {0}")]
    CircularBackReference(u64),
    #[error("position stack exceeded cap of {MAX_POSITION_STACK}")]
    PositionStackOverflow,
    #[error("position stack underflow (pop without matching push)")]
    PositionStackUnderflow,
    #[error("seek to {offset} is out of bounds (buffer length {len})")]
    OutOfBoundsSeek { offset: u64, len: u64 },
    #[error("peek requires byte alignment, but {0} bits are pending")]
    UnalignedPeek(u32),
    #[error("instance field alignment violation: offset {offset} is not a multiple of {align}")]
    AlignmentViolation { offset: u64, align: u64 },
    #[error("malformed variable-length integer: {0}")]
    MalformedVarint(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            DecodeError::UnexpectedEof(0)
        } else {
            DecodeError::Io(e.to_string())
        }
    }
}
