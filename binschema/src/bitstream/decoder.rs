use std::io::Cursor;

use bitstream_io::{BigEndian, BitRead, BitReader, LittleEndian};

use crate::schema::{BitOrder, Endianness};

use super::varint;
use super::{DecodeError, MAX_POSITION_STACK};

/// Runtime-selected bit-packed reader over a borrowed byte slice.
///
/// Mirrors [`crate::bitstream::Encoder`]; additionally carries a bounded
/// stack of saved byte offsets (cap [`MAX_POSITION_STACK`]) and an
/// in-flight set of back-reference offsets used for cycle detection during
/// back-reference resolution.
pub struct Decoder<'a> {
    inner: Inner<'a>,
    len: u64,
    position_stack: Vec<u64>,
    in_flight_back_refs: Vec<u64>,
}

enum Inner<'a> {
    Msb(BitReader<Cursor<&'a [u8]>, BigEndian>),
    Lsb(BitReader<Cursor<&'a [u8]>, LittleEndian>),
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], bit_order: BitOrder) -> Self {
        let len = data.len() as u64;
        let inner = match bit_order {
            BitOrder::Msb => Inner::Msb(BitReader::new(Cursor::new(data))),
            BitOrder::Lsb => Inner::Lsb(BitReader::new(Cursor::new(data))),
        };
        Decoder {
            inner,
            len,
            position_stack: Vec::new(),
            in_flight_back_refs: Vec::new(),
        }
    }

    /// Total bit position from the start of the buffer.
    fn position_in_bits(&mut self) -> Result<u64, DecodeError> {
        Ok(match &mut self.inner {
            Inner::Msb(r) => r.position_in_bits()?,
            Inner::Lsb(r) => r.position_in_bits()?,
        })
    }

    pub fn is_byte_aligned(&mut self) -> Result<bool, DecodeError> {
        Ok(self.position_in_bits()? % 8 == 0)
    }

    pub fn byte_offset(&mut self) -> Result<u64, DecodeError> {
        Ok(self.position_in_bits()? / 8)
    }

    pub fn buffer_len(&self) -> u64 {
        self.len
    }

    pub fn has_more(&mut self) -> Result<bool, DecodeError> {
        Ok(self.byte_offset()? < self.len || !self.is_byte_aligned()?)
    }

    /// Dual of `Encoder::write_bits`: same value-order/byte-packing rules.
    pub fn read_bits(&mut self, n: u32) -> Result<u64, DecodeError> {
        if n == 0 || n > 64 {
            return Err(DecodeError::MalformedVarint("bit size out of range 1..=64"));
        }
        let offset = self.byte_offset().unwrap_or(0);
        let v = match &mut self.inner {
            Inner::Msb(r) => r.read(n),
            Inner::Lsb(r) => r.read(n),
        }
        .map_err(|_| DecodeError::UnexpectedEof(offset))?;
        Ok(v)
    }

    /// `readUint8`, optimized: byte-aligned reads consume the next whole
    /// byte; unaligned reads always proceed LSB-first regardless of the
    /// stream's configured bit order.
    pub fn read_uint8(&mut self) -> Result<u8, DecodeError> {
        if self.is_byte_aligned()? {
            let offset = self.byte_offset()?;
            let mut buf = [0u8; 1];
            match &mut self.inner {
                Inner::Msb(r) => r.read_bytes(&mut buf),
                Inner::Lsb(r) => r.read_bytes(&mut buf),
            }
            .map_err(|_| DecodeError::UnexpectedEof(offset))?;
            Ok(buf[0])
        } else {
            let offset = self.byte_offset().unwrap_or(0);
            let mut v = 0u8;
            for i in 0..8u32 {
                let bit = match &mut self.inner {
                    Inner::Msb(r) => r.read_bit(),
                    Inner::Lsb(r) => r.read_bit(),
                }
                .map_err(|_| DecodeError::UnexpectedEof(offset))?;
                if bit {
                    v |= 1 << i;
                }
            }
            Ok(v)
        }
    }

    fn read_bytes_with_endianness(&mut self, n: usize, e: Endianness) -> Result<u64, DecodeError> {
        let mut bytes = [0u8; 8];
        for slot in bytes.iter_mut().take(n) {
            *slot = self.read_uint8()?;
        }
        let relevant = &bytes[..n];
        let mut v: u64 = 0;
        match e {
            Endianness::Big => {
                for b in relevant {
                    v = (v << 8) | *b as u64;
                }
            }
            Endianness::Little => {
                for b in relevant.iter().rev() {
                    v = (v << 8) | *b as u64;
                }
            }
        }
        Ok(v)
    }

    pub fn read_uint16(&mut self, e: Endianness) -> Result<u16, DecodeError> {
        Ok(self.read_bytes_with_endianness(2, e)? as u16)
    }
    pub fn read_uint32(&mut self, e: Endianness) -> Result<u32, DecodeError> {
        Ok(self.read_bytes_with_endianness(4, e)? as u32)
    }
    pub fn read_uint64(&mut self, e: Endianness) -> Result<u64, DecodeError> {
        self.read_bytes_with_endianness(8, e)
    }
    pub fn read_int8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.read_uint8()? as i8)
    }
    pub fn read_int16(&mut self, e: Endianness) -> Result<i16, DecodeError> {
        Ok(self.read_uint16(e)? as i16)
    }
    pub fn read_int32(&mut self, e: Endianness) -> Result<i32, DecodeError> {
        Ok(self.read_uint32(e)? as i32)
    }
    pub fn read_int64(&mut self, e: Endianness) -> Result<i64, DecodeError> {
        Ok(self.read_uint64(e)? as i64)
    }
    pub fn read_float32(&mut self, e: Endianness) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.read_uint32(e)?))
    }
    pub fn read_float64(&mut self, e: Endianness) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_uint64(e)?))
    }

    pub fn read_der_varint(&mut self) -> Result<u64, DecodeError> {
        varint::read_der(self)
    }
    pub fn read_leb128(&mut self) -> Result<u64, DecodeError> {
        varint::read_leb128(self)
    }
    pub fn read_ebml(&mut self) -> Result<u64, DecodeError> {
        varint::read_ebml(self)
    }

    /// Non-consuming peeks; byte-aligned only.
    pub fn peek_uint8(&mut self) -> Result<u8, DecodeError> {
        self.peek_with(|d| d.read_uint8())
    }
    pub fn peek_uint16(&mut self, e: Endianness) -> Result<u16, DecodeError> {
        self.peek_with(|d| d.read_uint16(e))
    }
    pub fn peek_uint32(&mut self, e: Endianness) -> Result<u32, DecodeError> {
        self.peek_with(|d| d.read_uint32(e))
    }

    fn peek_with<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, DecodeError>,
    ) -> Result<T, DecodeError> {
        let bits = self.position_in_bits()?;
        if bits % 8 != 0 {
            return Err(DecodeError::UnalignedPeek((bits % 8) as u32));
        }
        let byte_offset = bits / 8;
        let result = f(self);
        self.seek(byte_offset)?;
        result
    }

    /// Sets the byte offset and resets the bit offset to 0. Valid range is
    /// `[0, bufferLength]`, end-inclusive so callers can detect EOF without
    /// reading.
    pub fn seek(&mut self, offset: u64) -> Result<(), DecodeError> {
        if offset > self.len {
            return Err(DecodeError::OutOfBoundsSeek {
                offset,
                len: self.len,
            });
        }
        let bits = offset
            .checked_mul(8)
            .ok_or(DecodeError::OutOfBoundsSeek { offset, len: self.len })?;
        match &mut self.inner {
            Inner::Msb(r) => r.seek_bits(std::io::SeekFrom::Start(bits)),
            Inner::Lsb(r) => r.seek_bits(std::io::SeekFrom::Start(bits)),
        }
        .map_err(|_| DecodeError::OutOfBoundsSeek {
            offset,
            len: self.len,
        })?;
        Ok(())
    }

    /// Pushes the current byte offset; fails past [`MAX_POSITION_STACK`]
    /// (DoS guard against adversarially deep back-reference chains).
    pub fn push_position(&mut self) -> Result<(), DecodeError> {
        if self.position_stack.len() >= MAX_POSITION_STACK {
            return Err(DecodeError::PositionStackOverflow);
        }
        let offset = self.byte_offset()?;
        self.position_stack.push(offset);
        Ok(())
    }

    /// Pops and seeks back to the saved offset.
    pub fn pop_position(&mut self) -> Result<(), DecodeError> {
        let offset = self
            .position_stack
            .pop()
            .ok_or(DecodeError::PositionStackUnderflow)?;
        self.seek(offset)
    }

    // -- back-reference cycle detection --------------------------------

    pub fn enter_back_reference(&mut self, offset: u64) -> Result<(), DecodeError> {
        if self.in_flight_back_refs.contains(&offset) {
            return Err(DecodeError::CircularBackReference(offset));
        }
        self.in_flight_back_refs.push(offset);
        Ok(())
    }

    pub fn exit_back_reference(&mut self, offset: u64) {
        if let Some(pos) = self.in_flight_back_refs.iter().rposition(|o| *o == offset) {
            self.in_flight_back_refs.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_aligned_uint8() {
        let mut d = Decoder::new(&[0xAB], BitOrder::Msb);
        assert_eq!(d.read_uint8().unwrap(), 0xAB);
    }

    #[test]
    fn multi_byte_endianness() {
        let mut d = Decoder::new(&[0x12, 0x34], BitOrder::Msb);
        assert_eq!(d.read_uint16(Endianness::Big).unwrap(), 0x1234);
        let mut d2 = Decoder::new(&[0x12, 0x34], BitOrder::Msb);
        assert_eq!(d2.read_uint16(Endianness::Little).unwrap(), 0x3412);
    }

    #[test]
    fn seek_and_peek_restore_position() {
        let mut d = Decoder::new(&[0x01, 0x02, 0x03], BitOrder::Msb);
        d.read_uint8().unwrap();
        let peeked = d.peek_uint8().unwrap();
        assert_eq!(peeked, 0x02);
        assert_eq!(d.byte_offset().unwrap(), 1);
        assert_eq!(d.read_uint8().unwrap(), 0x02);
    }

    #[test]
    fn seek_out_of_bounds_fails() {
        let mut d = Decoder::new(&[0x01], BitOrder::Msb);
        assert!(d.seek(2).is_err());
        assert!(d.seek(1).is_ok()); // end-inclusive
    }

    #[test]
    fn position_stack_cap_enforced() {
        let mut d = Decoder::new(&[0u8; 200], BitOrder::Msb);
        for _ in 0..MAX_POSITION_STACK {
            d.push_position().unwrap();
        }
        assert_eq!(d.push_position(), Err(DecodeError::PositionStackOverflow));
    }

    #[test]
    fn position_stack_underflow_fails() {
        let mut d = Decoder::new(&[0u8; 4], BitOrder::Msb);
        assert_eq!(d.pop_position(), Err(DecodeError::PositionStackUnderflow));
    }

    #[test]
    fn back_reference_cycle_detected() {
        let mut d = Decoder::new(&[0u8; 4], BitOrder::Msb);
        d.enter_back_reference(0).unwrap();
        assert_eq!(
            d.enter_back_reference(0),
            Err(DecodeError::CircularBackReference(0))
        );
        d.exit_back_reference(0);
        assert!(d.enter_back_reference(0).is_ok());
    }
}
