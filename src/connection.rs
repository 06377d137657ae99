//! Per-peer reliability, ordering, fragmentation, and replay state.
//!
//! See [`Connection`]. One exists per `(peer_ip, peer_port)`; it exclusively
//! owns its reliable queue, out-of-order buffer, fragment table, and replay
//! window; nothing outside the connection mutates them.

use std::{net::SocketAddr, time::Duration};

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    flags::PacketFlags,
    frag::{self, FragmentAssembler, FragmentError},
    packet::{self, PacketHeader},
    qos::{Priority, QosProfile, Reliability},
    replay::{ReplayError, ReplayWindow},
    rtt::RttEstimator,
    seq::Seq,
    stats::ConnectionStats,
};

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A reliable packet awaiting acknowledgement.
#[derive(Debug, Clone)]
struct ReliableEntry {
    sequence: Seq,
    payload: Bytes,
    flags: PacketFlags,
    reliability: Reliability,
    priority: Priority,
    max_retries: u32,
    retry_delay_ms: u64,
    attempts: u32,
    sent_at_ms: u64,
    next_attempt_at_ms: u64,
}

/// A packet ready to be reassembled, acknowledged, or delivered to the
/// application, paired with the header it arrived under (or, for a
/// reassembled fragment group, the header of its final fragment).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub header: PacketHeader,
    pub payload: Bytes,
}

/// Result of [`Connection::receive`].
#[derive(Debug, Clone, Default)]
pub struct ReceiveOutput {
    /// Encoded ACK packets that must be sent back to the peer.
    pub ack_packets: Vec<Bytes>,
    /// Payloads ready for the application callback, in delivery order.
    pub deliveries: Vec<Delivery>,
}

/// Errors [`Connection::receive`] can return. Replay is checked by the
/// caller beforehand via [`Connection::check_replay`], so it never appears
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// Per-peer connection state.
#[derive(Debug)]
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub client_id: String,
    pub state: ConnectionState,
    pub created_at_ms: u64,
    pub last_activity_ms: u64,
    pub last_send_ms: u64,

    next_sequence: Seq,
    last_delivered: Seq,
    reliable_queue: Vec<ReliableEntry>,
    ooo_buffer: AHashMap<u32, Delivery>,
    fragments: FragmentAssembler,
    replay: ReplayWindow,
    rtt: RttEstimator,
    pub stats: ConnectionStats,
}

impl Connection {
    /// Creates a connection for `peer_addr`, in the [`ConnectionState::Connecting`]
    /// state.
    #[must_use]
    pub fn new(peer_addr: SocketAddr, now_ms: u64) -> Self {
        Self {
            client_id: peer_addr.to_string(),
            peer_addr,
            state: ConnectionState::Connecting,
            created_at_ms: now_ms,
            last_activity_ms: now_ms,
            last_send_ms: now_ms,
            next_sequence: Seq::ZERO,
            last_delivered: Seq::ZERO,
            reliable_queue: Vec::new(),
            ooo_buffer: AHashMap::new(),
            fragments: FragmentAssembler::new(),
            replay: ReplayWindow::new(),
            rtt: RttEstimator::new(),
            stats: ConnectionStats::default(),
        }
    }

    /// Number of reliable entries still awaiting acknowledgement or retry.
    #[must_use]
    pub fn queued_packet_count(&self) -> usize {
        self.reliable_queue.len()
    }

    /// Smoothed round-trip time, or `None` before the first sample.
    #[must_use]
    pub fn average_rtt(&self) -> Option<Duration> {
        self.rtt.average()
    }

    /// Marks the connection established (an ack of the implicit CONNECT was
    /// observed, or the transport treats first contact as sufficient).
    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
    }

    /// Begins a graceful disconnect: enqueues a reliable DISCONNECT
    /// notification under [`QosProfile::SYSTEM`] and moves to
    /// [`ConnectionState::Disconnecting`]. Call [`Connection::is_drained`]
    /// afterward to know when it is safe to remove this connection.
    pub fn begin_disconnect(&mut self, now_ms: u64, now_secs: u64) -> Bytes {
        self.state = ConnectionState::Disconnecting;
        self.send(b"DISCONNECT", &QosProfile::SYSTEM, PacketFlags::empty(), now_ms, now_secs)
            .into_iter()
            .next()
            .expect("non-empty payload produces exactly one packet when unfragmented")
    }

    /// Whether a [`ConnectionState::Disconnecting`] connection has flushed
    /// its reliable queue and may now be removed.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.state == ConnectionState::Disconnecting && self.reliable_queue.is_empty()
    }

    /// Checks `sequence` against this connection's replay window. Must be
    /// called, and must succeed, before [`Connection::receive`] is called
    /// for the same packet.
    ///
    /// # Errors
    ///
    /// See [`ReplayError`].
    pub fn check_replay(&mut self, sequence: Seq) -> Result<(), ReplayError> {
        self.replay.check(sequence)
    }

    /// Encodes `payload` for transmission under `profile`, fragmenting if
    /// necessary and enqueuing a reliable entry per fragment when
    /// `profile.reliability.is_reliable()`.
    ///
    /// `extra_flags` is OR'd into every fragment's flags (used for
    /// `COMPRESSED`/`ENCRYPTED`, which the caller sets after transforming
    /// `payload` and before calling this).
    #[must_use]
    pub fn send(
        &mut self,
        payload: &[u8],
        profile: &QosProfile,
        extra_flags: PacketFlags,
        now_ms: u64,
        now_secs: u64,
    ) -> Vec<Bytes> {
        let pieces = if profile.needs_fragmentation(payload.len()) {
            frag::fragment(payload, profile.fragment_size, self.allocate_sequence())
        } else {
            vec![(self.allocate_sequence(), true, Bytes::copy_from_slice(payload))]
        };

        let is_fragmented = pieces.len() > 1;
        let mut out = Vec::with_capacity(pieces.len());
        for (sequence, is_last, chunk) in pieces {
            let mut flags = extra_flags;
            if is_fragmented {
                flags |= PacketFlags::IS_FRAGMENT;
                if is_last {
                    flags |= PacketFlags::LAST_FRAGMENT;
                }
            }

            let header = PacketHeader {
                sequence,
                ack_sequence: 0,
                data_length: 0,
                flags,
                reliability: profile.reliability,
                priority: profile.priority,
                timestamp: now_secs,
            };

            let encoded = packet::encode(header, &chunk, now_secs).expect("header built from a valid profile");

            if profile.reliability.is_reliable() {
                self.reliable_queue.push(ReliableEntry {
                    sequence,
                    payload: chunk,
                    flags,
                    reliability: profile.reliability,
                    priority: profile.priority,
                    max_retries: profile.max_retries,
                    retry_delay_ms: profile.retry_delay_ms,
                    attempts: 0,
                    sent_at_ms: now_ms,
                    next_attempt_at_ms: now_ms,
                });
            }

            self.stats.bytes_sent += encoded.len() as u64;
            self.stats.packets_sent += 1;
            out.push(encoded);
        }
        self.last_send_ms = now_ms;
        out
    }

    /// Builds and encodes a bare acknowledgement packet for `acked_sequence`.
    /// Never enqueued as a reliable entry: a lost ack simply causes the
    /// peer's own retry to produce a fresh one.
    fn send_ack(&mut self, acked_sequence: u16, now_ms: u64, now_secs: u64) -> Bytes {
        let header = PacketHeader {
            sequence: self.allocate_sequence(),
            ack_sequence: acked_sequence,
            data_length: 0,
            flags: PacketFlags::HAS_ACKS,
            reliability: Reliability::Unreliable,
            priority: Priority::System,
            timestamp: now_secs,
        };
        let encoded = packet::encode(header, &[], now_secs).expect("ack header is always valid");
        self.stats.bytes_sent += encoded.len() as u64;
        self.stats.packets_sent += 1;
        self.last_send_ms = now_ms;
        encoded
    }

    fn allocate_sequence(&mut self) -> Seq {
        self.next_sequence = self.next_sequence.next();
        self.next_sequence
    }

    /// Processes one validated, non-replayed inbound packet.
    ///
    /// # Errors
    ///
    /// See [`ReceiveError`].
    pub fn receive(
        &mut self,
        header: PacketHeader,
        payload: Bytes,
        now_ms: u64,
        now_secs: u64,
    ) -> Result<ReceiveOutput, ReceiveError> {
        self.last_activity_ms = now_ms;
        self.stats.bytes_received += header_wire_len(&payload);
        self.stats.packets_received += 1;

        let mut output = ReceiveOutput::default();

        if header.flags.contains(PacketFlags::HAS_ACKS) {
            self.acknowledge(header.ack_sequence, now_ms);
            if payload.is_empty() {
                // pure ack packet: fully consumed here, never delivered or re-acked
                return Ok(output);
            }
        }

        if header.flags.contains(PacketFlags::IS_FRAGMENT) {
            let is_last = header.flags.contains(PacketFlags::LAST_FRAGMENT);
            match self.fragments.insert(header.sequence, is_last, payload, now_ms)? {
                Some(assembled) => {
                    let group = header.sequence.fragment_group();
                    let logical_header = PacketHeader {
                        sequence: Seq::from_fragment(group, 1),
                        ..header
                    };
                    self.apply_reliability_policy(logical_header, assembled, now_ms, now_secs, &mut output);
                }
                None => trace!(group = header.sequence.fragment_group(), "fragment buffered, group incomplete"),
            }
            return Ok(output);
        }

        self.apply_reliability_policy(header, payload, now_ms, now_secs, &mut output);
        Ok(output)
    }

    fn acknowledge(&mut self, ack_sequence: u16, now_ms: u64) {
        let acked = Seq::reconstruct(ack_sequence, self.next_sequence);
        if let Some(pos) = self.reliable_queue.iter().position(|e| e.sequence == acked) {
            let entry = self.reliable_queue.remove(pos);
            let sample_ms = now_ms.saturating_sub(entry.sent_at_ms);
            self.rtt.update(Duration::from_millis(sample_ms));
        }
    }

    fn apply_reliability_policy(
        &mut self,
        header: PacketHeader,
        payload: Bytes,
        now_ms: u64,
        now_secs: u64,
        output: &mut ReceiveOutput,
    ) {
        let seq = header.sequence;
        let needs_ack = matches!(
            header.reliability,
            Reliability::Reliable | Reliability::ReliableOrdered | Reliability::ReliableSequenced
        );
        if needs_ack {
            output.ack_packets.push(self.send_ack(seq.fragment_index(), now_ms, now_secs));
        }

        match header.reliability {
            Reliability::Unreliable => {
                output.deliveries.push(Delivery { header, payload });
            }
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced => {
                if seq > self.last_delivered {
                    self.last_delivered = seq;
                    output.deliveries.push(Delivery { header, payload });
                }
            }
            Reliability::Reliable => {
                output.deliveries.push(Delivery { header, payload });
            }
            Reliability::ReliableOrdered => {
                self.deliver_ordered(header, payload, output);
            }
        }
    }

    fn deliver_ordered(&mut self, header: PacketHeader, payload: Bytes, output: &mut ReceiveOutput) {
        let seq = header.sequence;
        if seq <= self.last_delivered {
            debug!(?seq, "dropping stale ordered packet");
            return;
        }
        if seq == self.last_delivered.next() {
            self.last_delivered = seq;
            output.deliveries.push(Delivery { header, payload });
            while let Some(next) = self.ooo_buffer.remove(&self.last_delivered.next().0) {
                self.last_delivered = next.header.sequence;
                output.deliveries.push(next);
            }
        } else {
            self.ooo_buffer.insert(seq.0, Delivery { header, payload });
        }
    }

    /// Drives retransmission: resends reliable entries whose deadline has
    /// passed, applying exponential backoff, and drops entries that have
    /// exhausted `max_retries`.
    #[must_use]
    pub fn tick_retransmit(&mut self, now_ms: u64, now_secs: u64) -> Vec<Bytes> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.reliable_queue.len() {
            if now_ms < self.reliable_queue[i].next_attempt_at_ms {
                i += 1;
                continue;
            }
            let entry = &mut self.reliable_queue[i];
            entry.attempts += 1;
            if entry.attempts > entry.max_retries {
                warn!(sequence = ?entry.sequence, "reliable entry exhausted retries, treating as lost");
                self.stats.packets_lost += 1;
                self.reliable_queue.remove(i);
                continue;
            }

            let header = PacketHeader {
                sequence: entry.sequence,
                ack_sequence: 0,
                data_length: 0,
                flags: entry.flags,
                reliability: entry.reliability,
                priority: entry.priority,
                timestamp: now_secs,
            };
            let encoded = packet::encode(header, &entry.payload, now_secs).expect("previously-valid header stays valid");
            let delay_ms = entry.retry_delay_ms.saturating_mul(1u64 << entry.attempts.min(32));
            entry.next_attempt_at_ms = now_ms + delay_ms;
            out.push(encoded);
            i += 1;
        }
        out
    }

    /// Whether this connection has had no inbound activity for longer than
    /// `timeout_ms`.
    #[must_use]
    pub fn is_timed_out(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_activity_ms) > timeout_ms
    }

    /// Whether this connection has sent nothing for `interval_ms` and
    /// should emit a keep-alive.
    #[must_use]
    pub fn needs_keep_alive(&self, now_ms: u64, interval_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_send_ms) >= interval_ms
    }

    /// Evicts fragment groups that have been incomplete for longer than
    /// `timeout_ms`.
    pub fn evict_expired_fragments(&mut self, now_ms: u64, timeout_ms: u64) {
        self.fragments.evict_expired(now_ms, timeout_ms);
    }
}

fn header_wire_len(payload: &Bytes) -> u64 {
    (packet::HEADER_SIZE + payload.len()) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn reliable_send_enqueues_and_acks_clear_it() {
        let mut client = Connection::new(addr(), 0);
        let packets = client.send(b"ping", &QosProfile::DEFAULT, PacketFlags::empty(), 0, 0);
        assert_eq!(packets.len(), 1);
        assert_eq!(client.queued_packet_count(), 1);

        let (header, _) = packet::decode(&packets[0], 0).unwrap();

        let mut server = Connection::new(addr(), 0);
        let result = server.receive(header, Bytes::new(), 0, 0).unwrap();
        assert_eq!(result.ack_packets.len(), 1);

        let (ack_header, ack_payload) = packet::decode(&result.ack_packets[0], 0).unwrap();
        assert!(ack_header.flags.contains(PacketFlags::HAS_ACKS));
        assert_eq!(ack_header.ack_sequence, header.sequence.fragment_index());
        assert!(ack_payload.is_empty());

        let ack_result = client.receive(ack_header, ack_payload, 10, 0).unwrap();
        assert!(ack_result.ack_packets.is_empty());
        assert!(ack_result.deliveries.is_empty());
        assert_eq!(client.queued_packet_count(), 0);
        assert!(client.average_rtt().is_some());
    }

    #[test]
    fn reliable_ordered_buffers_and_drains_out_of_order_packets() {
        let mut conn = Connection::new(addr(), 0);
        let mut headers = Vec::new();
        for i in 1..=3u32 {
            let header = PacketHeader::new(Seq::new(i), Reliability::ReliableOrdered, Priority::Normal, 0);
            headers.push((header, Bytes::from(format!("msg{i}"))));
        }

        let mut delivered = Vec::new();
        for idx in [2, 0, 1] {
            let (header, payload) = headers[idx].clone();
            let result = conn.receive(header, payload, 0, 0).unwrap();
            delivered.extend(result.deliveries.into_iter().map(|d| d.payload));
        }

        assert_eq!(delivered, vec![Bytes::from("msg1"), Bytes::from("msg2"), Bytes::from("msg3")]);
    }

    #[test]
    fn unreliable_sequenced_drops_stale_packets() {
        let mut conn = Connection::new(addr(), 0);
        let newer = PacketHeader::new(Seq::new(5), Reliability::UnreliableSequenced, Priority::Normal, 0);
        let older = PacketHeader::new(Seq::new(3), Reliability::UnreliableSequenced, Priority::Normal, 0);

        let result = conn.receive(newer, Bytes::from("new"), 0, 0).unwrap();
        assert_eq!(result.deliveries.len(), 1);

        let result = conn.receive(older, Bytes::from("old"), 0, 0).unwrap();
        assert!(result.deliveries.is_empty());
    }

    #[test]
    fn retransmit_gives_up_after_max_retries() {
        let mut profile = QosProfile::DEFAULT;
        profile.max_retries = 1;
        profile.retry_delay_ms = 10;

        let mut conn = Connection::new(addr(), 0);
        conn.send(b"x", &profile, PacketFlags::empty(), 0, 0);

        let first = conn.tick_retransmit(10, 0);
        assert_eq!(first.len(), 1);
        assert_eq!(conn.queued_packet_count(), 1);

        let second = conn.tick_retransmit(1000, 0);
        assert!(second.is_empty());
        assert_eq!(conn.queued_packet_count(), 0);
        assert_eq!(conn.stats.packets_lost, 1);
    }

    #[test]
    fn fragmented_payload_reassembles_before_delivery() {
        let mut conn = Connection::new(addr(), 0);
        let payload = vec![9u8; 2048];
        let packets = conn.send(&payload, &QosProfile::BULK, PacketFlags::empty(), 0, 0);
        assert!(packets.len() > 1);

        let mut receiver = Connection::new(addr(), 0);
        let mut assembled = None;
        for p in packets {
            let (header, body) = packet::decode(&p, 0).unwrap();
            let result = receiver.receive(header, body, 0, 0).unwrap();
            if let Some(d) = result.deliveries.into_iter().next() {
                assembled = Some(d.payload);
            }
        }
        assert_eq!(assembled.unwrap(), Bytes::from(payload));
    }
}
