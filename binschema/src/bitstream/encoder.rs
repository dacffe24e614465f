use bitstream_io::{BigEndian, BitWrite, BitWriter, LittleEndian};
use rustc_hash::FxHashMap;

use crate::schema::{BitOrder, Endianness};

use super::varint;
use super::EncodeError;

/// Runtime-selected bit-packed writer over a growing in-memory buffer.
///
/// One [`Encoder`] is constructed per `encode()` invocation — no state
/// survives between invocations. It owns:
/// - the partial-bit-packed output buffer,
/// - a structural-key → byte-offset compression dictionary used by
///   `back_reference` emission to deduplicate repeated values,
/// - per-`(array field, item type)` position tables used by
///   `corresponding<T>`/`first<T>`/`last<T>` computed-field selectors, plus
///   the matching iteration-index counters.
pub struct Encoder {
    inner: Inner,
    /// Bits written so far, tracked independently of `bitstream_io` (whose
    /// `position_in_bits` requires a seekable sink, which a plain `Vec<u8>`
    /// is not). `byte_offset` and `is_byte_aligned` are derived from this.
    bits_written: u64,
    /// Populated → cleared only by constructing a fresh `Encoder`; never
    /// reused across calls.
    compression_dict: FxHashMap<Vec<u8>, u64>,
    /// `(array_field, item_type) -> [byte offset at which each item of that
    /// type was written]`, appended to on every matching item.
    position_tables: FxHashMap<(String, String), Vec<u64>>,
    /// `(array_field, item_type) -> count of items of that type emitted so
    /// far`, incremented alongside `position_tables`.
    index_counters: FxHashMap<(String, String), usize>,
    /// Stack of `(array_field, index)` the encoder is currently iterating,
    /// innermost last; used to resolve `corresponding<T>` during encode.
    array_context: Vec<(String, usize)>,
}

enum Inner {
    Msb(BitWriter<Vec<u8>, BigEndian>),
    Lsb(BitWriter<Vec<u8>, LittleEndian>),
}

impl Encoder {
    pub fn new(bit_order: BitOrder) -> Self {
        let inner = match bit_order {
            BitOrder::Msb => Inner::Msb(BitWriter::new(Vec::new())),
            BitOrder::Lsb => Inner::Lsb(BitWriter::new(Vec::new())),
        };
        Encoder {
            inner,
            bits_written: 0,
            compression_dict: FxHashMap::default(),
            position_tables: FxHashMap::default(),
            index_counters: FxHashMap::default(),
            array_context: Vec::new(),
        }
    }

    /// Writes the low `n` bits of `v` (`1 ≤ n ≤ 64`) in value-order: LSB of
    /// the value first when the stream's bit order is LSB-first, else MSB
    /// first; the containing byte is packed from the configured side
    ///.
    pub fn write_bits(&mut self, v: u64, n: u32) -> Result<(), EncodeError> {
        if n == 0 || n > 64 {
            return Err(EncodeError::InvalidBitSize(n));
        }
        let masked = if n == 64 { v } else { v & ((1u64 << n) - 1) };
        match &mut self.inner {
            Inner::Msb(w) => w.write(n, masked),
            Inner::Lsb(w) => w.write(n, masked),
        }
        .expect("writes to an in-memory Vec<u8> never fail");
        self.bits_written += n as u64;
        Ok(())
    }

    /// `writeUint8`, optimized: byte-aligned writes append the byte
    /// directly; unaligned writes always proceed LSB-first regardless of
    /// the stream's configured bit order — the established wire contract
    /// for byte values straddling a bit boundary.
    pub fn write_uint8(&mut self, v: u8) -> Result<(), EncodeError> {
        if self.is_byte_aligned() {
            match &mut self.inner {
                Inner::Msb(w) => w.write_bytes(&[v]),
                Inner::Lsb(w) => w.write_bytes(&[v]),
            }
            .expect("writes to an in-memory Vec<u8> never fail");
        } else {
            for i in 0..8u32 {
                let bit = (v >> i) & 1 != 0;
                match &mut self.inner {
                    Inner::Msb(w) => w.write_bit(bit),
                    Inner::Lsb(w) => w.write_bit(bit),
                }
                .expect("writes to an in-memory Vec<u8> never fail");
            }
        }
        self.bits_written += 8;
        Ok(())
    }

    pub fn is_byte_aligned(&self) -> bool {
        self.bits_written % 8 == 0
    }

    fn write_bytes_be(&mut self, bytes: &[u8], endianness: Endianness) -> Result<(), EncodeError> {
        match endianness {
            Endianness::Big => {
                for b in bytes {
                    self.write_uint8(*b)?;
                }
            }
            Endianness::Little => {
                for b in bytes.iter().rev() {
                    self.write_uint8(*b)?;
                }
            }
        }
        Ok(())
    }

    pub fn write_uint16(&mut self, v: u16, e: Endianness) -> Result<(), EncodeError> {
        self.write_bytes_be(&v.to_be_bytes(), e)
    }
    pub fn write_uint32(&mut self, v: u32, e: Endianness) -> Result<(), EncodeError> {
        self.write_bytes_be(&v.to_be_bytes(), e)
    }
    pub fn write_uint64(&mut self, v: u64, e: Endianness) -> Result<(), EncodeError> {
        self.write_bytes_be(&v.to_be_bytes(), e)
    }
    pub fn write_int8(&mut self, v: i8) -> Result<(), EncodeError> {
        self.write_uint8(v as u8)
    }
    pub fn write_int16(&mut self, v: i16, e: Endianness) -> Result<(), EncodeError> {
        self.write_uint16(v as u16, e)
    }
    pub fn write_int32(&mut self, v: i32, e: Endianness) -> Result<(), EncodeError> {
        self.write_uint32(v as u32, e)
    }
    pub fn write_int64(&mut self, v: i64, e: Endianness) -> Result<(), EncodeError> {
        self.write_uint64(v as u64, e)
    }
    pub fn write_float32(&mut self, v: f32, e: Endianness) -> Result<(), EncodeError> {
        self.write_uint32(v.to_bits(), e)
    }
    pub fn write_float64(&mut self, v: f64, e: Endianness) -> Result<(), EncodeError> {
        self.write_uint64(v.to_bits(), e)
    }

    pub fn write_der_varint(&mut self, v: u64) -> Result<(), EncodeError> {
        varint::write_der(self, v)
    }
    pub fn write_leb128(&mut self, v: u64) -> Result<(), EncodeError> {
        varint::write_leb128(self, v)
    }
    pub fn write_ebml(&mut self, v: u64) -> Result<(), EncodeError> {
        varint::write_ebml(self, v)
    }

    /// Currently-complete byte count; used for back-reference dictionary
    /// offsets and `position_of`.
    pub fn byte_offset(&self) -> u64 {
        self.bits_written / 8
    }

    /// Flushes any partial byte (zero-padded) and returns the buffer.
    pub fn finish(self) -> Vec<u8> {
        match self.inner {
            Inner::Msb(mut w) => {
                w.byte_align().expect("flushing to Vec<u8> never fails");
                w.into_writer()
            }
            Inner::Lsb(mut w) => {
                w.byte_align().expect("flushing to Vec<u8> never fails");
                w.into_writer()
            }
        }
    }

    // -- back-reference compression dictionary -----------------------

    /// Looks up a previously-recorded offset for this structural key.
    pub fn dict_lookup(&self, key: &[u8]) -> Option<u64> {
        self.compression_dict.get(key).copied()
    }

    /// Records the current byte offset under `key` if not already present.
    pub fn dict_record(&mut self, key: Vec<u8>, offset: u64) {
        self.compression_dict.entry(key).or_insert(offset);
    }

    // -- same_index / corresponding position tables -------------------

    pub fn enter_array(&mut self, array_field: &str) {
        self.array_context.push((array_field.to_string(), 0));
    }

    pub fn advance_array_index(&mut self) {
        if let Some(top) = self.array_context.last_mut() {
            top.1 += 1;
        }
    }

    pub fn exit_array(&mut self) {
        self.array_context.pop();
    }

    /// Current iteration index of the innermost array field named
    /// `array_field`, if the encoder is presently iterating it.
    pub fn current_array_index(&self, array_field: &str) -> Option<usize> {
        self.array_context
            .iter()
            .rev()
            .find(|(name, _)| name == array_field)
            .map(|(_, idx)| idx)
            .copied()
    }

    /// Records that an item of `item_type` was just written inside
    /// `array_field`, at the current byte offset.
    pub fn record_item_position(&mut self, array_field: &str, item_type: &str) {
        let key = (array_field.to_string(), item_type.to_string());
        let offset = self.byte_offset();
        self.position_tables.entry(key.clone()).or_default().push(offset);
        *self.index_counters.entry(key).or_insert(0) += 1;
    }

    /// `arr[first<T>]` / `arr[last<T>]` resolution: `None` means "absent",
    /// which callers render as `0xFFFFFFFF`.
    pub fn first_position(&self, array_field: &str, item_type: &str) -> Option<u64> {
        self.position_tables
            .get(&(array_field.to_string(), item_type.to_string()))
            .and_then(|v| v.first().copied())
    }
    pub fn last_position(&self, array_field: &str, item_type: &str) -> Option<u64> {
        self.position_tables
            .get(&(array_field.to_string(), item_type.to_string()))
            .and_then(|v| v.last().copied())
    }

    /// `arr[corresponding<T>]` resolution against the live iteration index.
    pub fn corresponding_position(
        &self,
        array_field: &str,
        item_type: &str,
    ) -> Result<Option<u64>, EncodeError> {
        let idx = self
            .current_array_index(array_field)
            .ok_or_else(|| EncodeError::CorrespondingOutsideArray(item_type.to_string()))?;
        Ok(self
            .position_tables
            .get(&(array_field.to_string(), item_type.to_string()))
            .and_then(|v| v.get(idx).copied()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_aligned_uint8_appends_directly() {
        let mut e = Encoder::new(BitOrder::Msb);
        e.write_uint8(0xAB).unwrap();
        assert_eq!(e.finish(), vec![0xAB]);
    }

    #[test]
    fn unaligned_uint8_is_lsb_first_regardless_of_order() {
        let mut e = Encoder::new(BitOrder::Msb);
        e.write_bits(0b101, 3).unwrap();
        e.write_uint8(0b0000_0001).unwrap();
        let bytes = e.finish();
        // 3 MSB-first bits `101`, then LSB-first byte `0000_0001` -> bit0=1 first.
        assert_eq!(bytes.len(), 2);
    }

    #[test]
    fn multi_byte_big_endian() {
        let mut e = Encoder::new(BitOrder::Msb);
        e.write_uint16(0x1234, Endianness::Big).unwrap();
        assert_eq!(e.finish(), vec![0x12, 0x34]);
    }

    #[test]
    fn multi_byte_little_endian() {
        let mut e = Encoder::new(BitOrder::Msb);
        e.write_uint16(0x1234, Endianness::Little).unwrap();
        assert_eq!(e.finish(), vec![0x34, 0x12]);
    }

    #[test]
    fn bit_packing_msb_first() {
        let mut e = Encoder::new(BitOrder::Msb);
        e.write_bits(0b1, 1).unwrap();
        e.write_bits(0b0, 1).unwrap();
        e.write_bits(0b1, 1).unwrap();
        e.write_bits(0b00000, 5).unwrap();
        assert_eq!(e.finish(), vec![0b1010_0000]);
    }

    #[test]
    fn invalid_bit_size_rejected() {
        let mut e = Encoder::new(BitOrder::Msb);
        assert_eq!(e.write_bits(1, 0), Err(EncodeError::InvalidBitSize(0)));
        assert_eq!(e.write_bits(1, 65), Err(EncodeError::InvalidBitSize(65)));
    }
}
