//! Packet framing: header layout, checksum placement, and the
//! `encode`/`decode` pair every other layer builds on.
//!
//! The wire header is a fixed 18 bytes, big-endian throughout. To fit
//! `reliability-class`, `priority`, `ack-sequence` and `timestamp` into that
//! budget while keeping every field named in the layout, three fields are
//! packed or truncated relative to their natural width; see the module-level
//! constants and [`PacketHeader`] docs for the exact packing, and `DESIGN.md`
//! for why.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    checksum,
    flags::PacketFlags,
    qos::{Priority, Reliability},
    seq::Seq,
};

/// Magic value every packet must begin with.
pub const MAGIC: u16 = 0xBAE0;

/// Size in bytes of the encoded header (not including the payload).
pub const HEADER_SIZE: usize = 18;

/// Largest encoded packet (header + payload) this transport will send or
/// accept.
pub const MAX_SIZE: usize = 8192;

/// Largest number of fragments a single logical packet may be split into.
pub const MAX_FRAGMENTS: u16 = 64;

/// A packet's timestamp may lag the receiver's clock by at most this many
/// seconds.
pub const TIMESTAMP_PAST_TOLERANCE: u64 = 30;

/// A packet's timestamp may lead the receiver's clock by at most this many
/// seconds.
pub const TIMESTAMP_FUTURE_TOLERANCE: u64 = 5;

/// Period of the truncated wire timestamp, in seconds (`2^16`).
const TIMESTAMP_WIRE_PERIOD: u64 = 1 << 16;

/// Decoded packet header.
///
/// `ack_sequence` and `timestamp` are both truncated on the wire (see module
/// docs), but only `timestamp` is reconstructed to full width here: doing so
/// needs only the receiver's clock, which `decode` already has. `ack_sequence`
/// needs the acknowledging connection's own sequence counter as a reference
/// point, so it stays truncated in this struct and is reconstructed by
/// [`crate::seq::Seq::reconstruct`] at the connection layer, where that
/// counter is in scope. `reliability` and `priority` share a single wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: Seq,
    /// Low 16 bits of the sequence this packet is acknowledging, as received
    /// on the wire. Only meaningful when `flags` contains
    /// [`PacketFlags::HAS_ACKS`]; reconstruct the full [`Seq`] via
    /// [`crate::seq::Seq::reconstruct`] before matching it against a
    /// reliable queue.
    pub ack_sequence: u16,
    pub data_length: u16,
    pub flags: PacketFlags,
    pub reliability: Reliability,
    pub priority: Priority,
    /// Unix timestamp, in seconds, reconstructed from the truncated wire
    /// field against the clock value used to decode it.
    pub timestamp: u64,
}

impl PacketHeader {
    /// Builds a header for an outbound packet. `timestamp` should be the
    /// sender's current wall-clock time in seconds.
    #[must_use]
    pub fn new(sequence: Seq, reliability: Reliability, priority: Priority, timestamp: u64) -> Self {
        Self {
            sequence,
            ack_sequence: 0,
            data_length: 0,
            flags: PacketFlags::empty(),
            reliability,
            priority,
            timestamp,
        }
    }
}

/// Errors [`decode`] can return. Each corresponds to a distinct check in the
/// decode pipeline, so callers (admission, logging) can distinguish a
/// malformed frame from a deliberately hostile one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("packet shorter than the minimum frame size")]
    TooShort,
    #[error("packet larger than MAX_SIZE")]
    TooLarge,
    #[error("magic value did not match")]
    BadMagic,
    #[error("sequence number was zero")]
    InvalidSequence,
    #[error("declared data length exceeds MAX_SIZE - HEADER_SIZE")]
    InvalidSize,
    #[error("reliability class byte did not map to a known class")]
    InvalidReliability,
    #[error("priority byte did not map to a known priority")]
    InvalidPriority,
    #[error("reserved flag bits were set")]
    ReservedFlagsSet,
    #[error("fragment index exceeded MAX_FRAGMENTS")]
    InvalidFragmentIndex,
    #[error("timestamp fell outside the accepted window")]
    TimestampInvalid,
    #[error("checksum did not match")]
    BadChecksum,
    #[error("declared data length did not match actual payload length")]
    LengthMismatch,
}

/// Errors [`encode`] can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The header failed its own invariants before encoding was attempted.
    #[error("header failed invariant validation: {0}")]
    InvalidState(DecodeError),
}

/// Truncates a full timestamp to the 16-bit wire representation.
const fn truncate_timestamp(timestamp: u64) -> u16 {
    (timestamp % TIMESTAMP_WIRE_PERIOD) as u16
}

/// Reconstructs a full timestamp from its truncated wire form, choosing
/// whichever candidate (one period back, unchanged, one period forward) from
/// `now` is closest. Tolerance windows are tiny relative to the 2^16 s
/// period, so this is unambiguous.
fn reconstruct_timestamp(wire: u16, now: u64) -> u64 {
    let now_high = (now / TIMESTAMP_WIRE_PERIOD) * TIMESTAMP_WIRE_PERIOD;
    let candidates = [
        now_high.saturating_sub(TIMESTAMP_WIRE_PERIOD) + u64::from(wire),
        now_high + u64::from(wire),
        now_high + TIMESTAMP_WIRE_PERIOD + u64::from(wire),
    ];
    candidates
        .into_iter()
        .min_by_key(|c| c.abs_diff(now))
        .unwrap_or(now)
}

/// Validates the invariants a header must hold regardless of where it came
/// from: non-zero sequence, bounded data length, clean reserved bits, a
/// sane fragment index, and a timestamp within tolerance of `now`.
fn validate_invariants(header: &PacketHeader, now: u64) -> Result<(), DecodeError> {
    if header.sequence == Seq::ZERO {
        return Err(DecodeError::InvalidSequence);
    }
    if header.data_length as usize > MAX_SIZE - HEADER_SIZE {
        return Err(DecodeError::InvalidSize);
    }
    if header.flags.intersects(PacketFlags::RESERVED_MASK) {
        return Err(DecodeError::ReservedFlagsSet);
    }
    if header.flags.contains(PacketFlags::IS_FRAGMENT) && header.sequence.fragment_index() > MAX_FRAGMENTS {
        return Err(DecodeError::InvalidFragmentIndex);
    }
    let earliest = now.saturating_sub(TIMESTAMP_PAST_TOLERANCE);
    let latest = now.saturating_add(TIMESTAMP_FUTURE_TOLERANCE);
    if header.timestamp < earliest || header.timestamp > latest {
        return Err(DecodeError::TimestampInvalid);
    }
    Ok(())
}

/// Writes `header`'s fields (sans checksum) into `buf` at the wire
/// offsets, with the checksum field zeroed. Used both to build the real
/// encoded header and to recompute the checksum over it.
fn write_header_for_checksum(buf: &mut BytesMut, header: &PacketHeader) {
    buf.put_u16(MAGIC);
    buf.put_u32(header.sequence.0);
    buf.put_u16(header.ack_sequence);
    buf.put_u16(header.data_length);
    buf.put_u8(header.flags.bits());
    buf.put_u8(pack_reliability_priority(header.reliability, header.priority));
    buf.put_u16(truncate_timestamp(header.timestamp));
    buf.put_u32(0); // checksum placeholder
}

const fn pack_reliability_priority(reliability: Reliability, priority: Priority) -> u8 {
    ((reliability as u8) << 4) | (priority as u8)
}

const fn unpack_reliability_priority(byte: u8) -> (Option<Reliability>, Option<Priority>) {
    (Reliability::from_u8(byte >> 4), Priority::from_u8(byte & 0x0F))
}

/// Encodes `header` and `payload` into a single wire packet.
///
/// `header.data_length` is overwritten with `payload.len()` before encoding,
/// matching the documented encode order (validate, set length, checksum,
/// write, append payload).
///
/// # Errors
///
/// Errors if the header fails [`validate_invariants`] against `now`.
pub fn encode(mut header: PacketHeader, payload: &[u8], now: u64) -> Result<Bytes, EncodeError> {
    header.data_length = u16::try_from(payload.len()).unwrap_or(u16::MAX);
    validate_invariants(&header, now).map_err(EncodeError::InvalidState)?;

    let mut header_bytes = BytesMut::with_capacity(HEADER_SIZE);
    write_header_for_checksum(&mut header_bytes, &header);
    debug_assert_eq!(header_bytes.len(), HEADER_SIZE);

    let checksum = checksum::compute(&header_bytes, payload);
    let checksum_offset = HEADER_SIZE - 4;
    header_bytes[checksum_offset..].copy_from_slice(&checksum.to_be_bytes());

    let mut out = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out.freeze())
}

/// Decodes a wire packet into a header and payload, running the full
/// validation pipeline documented for the frame format.
///
/// `now` is the receiver's current wall-clock time in seconds, used both to
/// reconstruct the truncated timestamp field and to validate it.
///
/// # Errors
///
/// Returns the first [`DecodeError`] encountered, in the fixed order: frame
/// length floor, frame length ceiling, magic, field parsing, invariants,
/// checksum, payload length.
pub fn decode(bytes: &[u8], now: u64) -> Result<(PacketHeader, Bytes), DecodeError> {
    if bytes.len() < HEADER_SIZE + 2 {
        return Err(DecodeError::TooShort);
    }
    if bytes.len() > MAX_SIZE {
        return Err(DecodeError::TooLarge);
    }

    let mut cursor = bytes;
    let magic = cursor.get_u16();
    if magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }

    let sequence = Seq::new(cursor.get_u32());
    let ack_sequence = cursor.get_u16();
    let data_length = cursor.get_u16();
    let flags = PacketFlags::from_bits_retain(cursor.get_u8());
    let (reliability, priority) = unpack_reliability_priority(cursor.get_u8());
    let reliability = reliability.ok_or(DecodeError::InvalidReliability)?;
    let priority = priority.ok_or(DecodeError::InvalidPriority)?;
    let timestamp_wire = cursor.get_u16();
    let checksum_wire = cursor.get_u32();

    let timestamp = reconstruct_timestamp(timestamp_wire, now);
    let header = PacketHeader {
        sequence,
        ack_sequence,
        data_length,
        flags,
        reliability,
        priority,
        timestamp,
    };

    validate_invariants(&header, now)?;

    let mut header_bytes = BytesMut::with_capacity(HEADER_SIZE);
    write_header_for_checksum(&mut header_bytes, &header);
    let payload = &bytes[HEADER_SIZE..];
    let expected = checksum::compute(&header_bytes, payload);
    if expected != checksum_wire {
        return Err(DecodeError::BadChecksum);
    }

    if payload.len() != data_length as usize {
        return Err(DecodeError::LengthMismatch);
    }

    Ok((header, Bytes::copy_from_slice(payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(now: u64) -> PacketHeader {
        PacketHeader::new(Seq::new(42), Reliability::Reliable, Priority::Normal, now)
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let now = 1_000_000;
        let header = sample_header(now);
        let encoded = encode(header, b"ping", now).unwrap();
        let (decoded, payload) = decode(&encoded, now).unwrap();
        assert_eq!(decoded.sequence, header.sequence);
        assert_eq!(decoded.reliability, header.reliability);
        assert_eq!(decoded.priority, header.priority);
        assert_eq!(decoded.data_length, 4);
        assert_eq!(&payload[..], b"ping");
    }

    #[test]
    fn rejects_bad_magic() {
        let now = 1_000_000;
        let mut encoded = encode(sample_header(now), b"x", now).unwrap().to_vec();
        encoded[0] ^= 0xFF;
        assert_eq!(decode(&encoded, now).unwrap_err(), DecodeError::BadMagic);
    }

    #[test]
    fn rejects_tampered_payload_via_checksum() {
        let now = 1_000_000;
        let mut encoded = encode(sample_header(now), b"ping", now).unwrap().to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;
        assert_eq!(decode(&encoded, now).unwrap_err(), DecodeError::BadChecksum);
    }

    #[test]
    fn rejects_zero_sequence() {
        let now = 1_000_000;
        let header = PacketHeader::new(Seq::ZERO, Reliability::Reliable, Priority::Normal, now);
        assert_eq!(
            encode(header, b"x", now).unwrap_err(),
            EncodeError::InvalidState(DecodeError::InvalidSequence)
        );
    }

    #[test]
    fn rejects_timestamp_outside_window() {
        let now = 1_000_000;
        let header = PacketHeader::new(Seq::new(1), Reliability::Reliable, Priority::Normal, now - 60);
        assert_eq!(
            encode(header, b"x", now).unwrap_err(),
            EncodeError::InvalidState(DecodeError::TimestampInvalid)
        );
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let now = 1_000_000;
        let mut header = sample_header(now);
        header.flags = PacketFlags::from_bits_retain(0b1000_0000);
        assert_eq!(
            encode(header, b"x", now).unwrap_err(),
            EncodeError::InvalidState(DecodeError::ReservedFlagsSet)
        );
    }

    #[test]
    fn rejects_fragment_index_over_limit() {
        let now = 1_000_000;
        let mut header = sample_header(now);
        header.flags = PacketFlags::IS_FRAGMENT;
        header.sequence = Seq::from_fragment(1, MAX_FRAGMENTS + 1);
        assert_eq!(
            encode(header, b"x", now).unwrap_err(),
            EncodeError::InvalidState(DecodeError::InvalidFragmentIndex)
        );
    }

    #[test]
    fn rejects_undersized_frame() {
        assert_eq!(decode(&[0u8; 4], 0).unwrap_err(), DecodeError::TooShort);
    }

    #[test]
    fn rejects_oversized_frame() {
        let huge = vec![0u8; MAX_SIZE + 1];
        assert_eq!(decode(&huge, 0).unwrap_err(), DecodeError::TooLarge);
    }

    #[test]
    fn timestamp_reconstruction_handles_wraparound_near_boundary() {
        let now = TIMESTAMP_WIRE_PERIOD + 2;
        let wire = truncate_timestamp(TIMESTAMP_WIRE_PERIOD - 1);
        let reconstructed = reconstruct_timestamp(wire, now);
        assert_eq!(reconstructed, TIMESTAMP_WIRE_PERIOD - 1);
    }
}
