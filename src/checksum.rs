//! CRC-32 checksum used by [`crate::packet`].
//!
//! The wire format specifies polynomial `0x04C11DB7`, initial value
//! `0xFFFFFFFF`, no reflection of input or output, and a final XOR of
//! `0xFFFFFFFF`. This is the standard `CRC-32/BZIP2` parameter set, so we
//! reach for the `crc` crate's catalog rather than hand-rolling the bit
//! fiddling ourselves.

use crc::{Algorithm, Crc};

/// CRC-32 parameters used for [`crate::packet::PacketHeader::checksum`].
///
/// Equivalent to the well-known `CRC-32/BZIP2` algorithm.
pub const ALGORITHM: Algorithm<u32> = crc::CRC_32_BZIP2;

static CRC: Crc<u32> = Crc::<u32>::new(&ALGORITHM);

/// Computes the checksum over `header_bytes` (with the checksum field
/// zeroed) followed by `payload`.
#[must_use]
pub fn compute(header_bytes: &[u8], payload: &[u8]) -> u32 {
    let mut digest = CRC.digest();
    digest.update(header_bytes);
    digest.update(payload);
    digest.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // "123456789" is the standard CRC check string; CRC-32/BZIP2's
        // check value (with no trailing payload) is well known.
        let mut digest = CRC.digest();
        digest.update(b"123456789");
        assert_eq!(digest.finalize(), 0xFC89_1918);
    }

    #[test]
    fn sensitive_to_single_bit_flips() {
        let base = compute(&[1, 2, 3, 4], &[5, 6]);
        for byte in 0..4u8 {
            for bit in 0..8u8 {
                let mut header = [1u8, 2, 3, 4];
                header[byte as usize] ^= 1 << bit;
                assert_ne!(compute(&header, &[5, 6]), base);
            }
        }
    }
}
