//! IEEE CRC-32 (reflected), used both by the generated code a `crc32_of`
//! computed field calls into at runtime, and directly by this crate's own
//! tests. Implemented via the `crc` crate rather than hand-rolled, matching
//! how the example pack reaches for it
//! (`other_examples/97da50ad_platform-system-interface-intel_fw__src-ifwi.rs.rs`).

use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32_IEEE: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Standard reflected CRC-32 (IEEE 802.3 polynomial) over `data`.
pub fn crc32_ieee(data: &[u8]) -> u32 {
    CRC32_IEEE.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // Canonical CRC-32 check value for the ASCII string "123456789".
        assert_eq!(crc32_ieee(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn empty_input_is_zero() {
        assert_eq!(crc32_ieee(b""), 0);
    }
}
