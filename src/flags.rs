//! Packet flag bits.
//!
//! [`PacketFlags`] is the single byte that travels on the wire inside
//! [`crate::packet::PacketHeader`].

use bitflags::bitflags;

bitflags! {
    /// Flags carried in [`crate::packet::PacketHeader::flags`].
    ///
    /// Only the low 7 bits are assigned meaning; the top bit is reserved and
    /// must be `0` on any packet accepted by [`crate::packet::decode`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PacketFlags: u8 {
        /// This packet carries acknowledgement info in [`PacketHeader::ack_sequence`].
        ///
        /// [`PacketHeader::ack_sequence`]: crate::packet::PacketHeader::ack_sequence
        const HAS_ACKS       = 1 << 0;
        /// This packet is one fragment of a larger logical packet.
        const IS_FRAGMENT    = 1 << 1;
        /// This is the final fragment of its fragment group.
        const LAST_FRAGMENT  = 1 << 2;
        /// The payload was compressed before encoding.
        const COMPRESSED     = 1 << 3;
        /// The payload was encrypted before encoding.
        const ENCRYPTED      = 1 << 4;
        /// The timestamp field should be treated as meaningful (it always is
        /// on the wire, but senders may clear this to opt out of timestamp
        /// validation on the receiver, if the receiver supports that).
        const HAS_TIMESTAMP  = 1 << 5;
        /// This packet's reliability/priority fields reflect a QoS profile
        /// rather than the defaults.
        const HAS_QOS        = 1 << 6;

        /// Bits outside this mask are reserved and must be zero on ingress.
        const RESERVED_MASK = !0b0111_1111;
    }
}
