//! See [`Seq`].

use std::{cmp::Ordering, fmt};

/// A wire sequence number, monotonically increasing modulo 2³².
///
/// Sequence numbers wrap around once [`u32::MAX`] is exceeded. Ordering and
/// distance between two sequence numbers always take wraparound into account
/// via [`Seq::dist_to`], so comparisons remain correct across a wrap as long
/// as the two numbers being compared are not further than `u32::MAX / 2`
/// apart.
///
/// See <https://gafferongames.com/post/reliable_ordered_messages/#fragment-packet-structure>.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub u32);

impl Seq {
    /// Sequence number `0`.
    ///
    /// Not a valid value for [`crate::packet::PacketHeader::sequence`]; the
    /// wire format reserves `0` to mean "no sequence yet assigned".
    pub const ZERO: Self = Self(0);

    /// Creates a sequence number from a raw integer.
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    /// Gets the next sequence number, wrapping at [`u32::MAX`].
    ///
    /// Since `0` is reserved, wrapping past [`u32::MAX`] lands on `1`, not
    /// `0`.
    #[must_use]
    pub const fn next(self) -> Self {
        let n = self.0.wrapping_add(1);
        if n == 0 { Self(1) } else { Self(n) }
    }

    /// Computes `rhs - self` as a signed distance, taking wraparound into
    /// account.
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i64 {
        let diff = rhs.0.wrapping_sub(self.0);
        // interpret the wrapped difference as the shortest signed path
        // around the 2^32 circle
        if diff <= i32::MAX as u32 {
            diff as i64
        } else {
            diff as i64 - (1i64 << 32)
        }
    }

    /// Gets the "fragment group" of this sequence number: its upper 16 bits.
    ///
    /// See [`crate::frag`] for how fragment groups are formed.
    #[must_use]
    pub const fn fragment_group(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Gets the "fragment index" of this sequence number: its lower 16 bits.
    #[must_use]
    pub const fn fragment_index(self) -> u16 {
        self.0 as u16
    }

    /// Builds a sequence number from a fragment group and index.
    #[must_use]
    pub const fn from_fragment(group: u16, index: u16) -> Self {
        Self(((group as u32) << 16) | index as u32)
    }

    /// Reconstructs a full sequence number from its truncated low 16 bits,
    /// choosing whichever candidate group (one period back, unchanged, one
    /// period forward) from `reference` lands closest to `reference`.
    ///
    /// Mirrors the timestamp reconstruction in [`crate::packet`]'s decode
    /// path: a wire value only carries the low 16 bits of a sequence
    /// number, so the high bits must be inferred from a nearby known-good
    /// sequence, here the sender's own last-assigned one.
    #[must_use]
    pub fn reconstruct(wire: u16, reference: Self) -> Self {
        const PERIOD: u32 = 1 << 16;
        let reference_high = reference.0 & !0xFFFF;
        let candidates = [
            Self(reference_high.wrapping_sub(PERIOD).wrapping_add(u32::from(wire))),
            Self(reference_high.wrapping_add(u32::from(wire))),
            Self(reference_high.wrapping_add(PERIOD).wrapping_add(u32::from(wire))),
        ];
        candidates
            .into_iter()
            .min_by_key(|c| c.dist_to(reference).abs())
            .unwrap_or(reference)
    }
}

impl PartialOrd for Seq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Seq {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.dist_to(*other) {
            0 => Ordering::Equal,
            d if d > 0 => Ordering::Less,
            _ => Ordering::Greater,
        }
    }
}

impl fmt::Debug for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_handles_wraparound() {
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u32::MAX) < Seq(1));
        assert!(Seq(u32::MAX - 3) < Seq(2));
    }

    #[test]
    fn next_skips_zero() {
        assert_eq!(Seq(u32::MAX).next(), Seq(1));
        assert_eq!(Seq(5).next(), Seq(6));
    }

    #[test]
    fn fragment_group_and_index_round_trip() {
        let s = Seq::from_fragment(0xBEEF, 4);
        assert_eq!(s.fragment_group(), 0xBEEF);
        assert_eq!(s.fragment_index(), 4);
    }

    #[test]
    fn reconstruct_recovers_full_sequence_past_first_wraparound() {
        let reference = Seq::new(70_000);
        let wire = Seq::new(65_991).fragment_index();
        assert_eq!(Seq::reconstruct(wire, reference), Seq::new(65_991));
    }

    #[test]
    fn reconstruct_picks_forward_candidate_just_after_a_16_bit_boundary() {
        let reference = Seq::new(65_530);
        let wire = Seq::new(65_540).fragment_index();
        assert_eq!(Seq::reconstruct(wire, reference), Seq::new(65_540));
    }
}
