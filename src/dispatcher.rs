//! Owns the UDP socket, the connection table, and the admission tables; the
//! only component that may mutate any of them. See [`Dispatcher`].

use std::{
    io,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    admission::{AdmissionOutcome, AdmissionTables},
    codecs::{CompressionCodec, EncryptionCodec, HwidGate, IntegrityOracle, SuspiciousPayloadFilter},
    condition::{NetworkConditioner, Outcome},
    config::Config,
    connection::{Connection, ConnectionState},
    flags::PacketFlags,
    integrity::{IntegrityHandshake, IntegrityOutcome},
    packet::{self, PacketHeader},
    qos::{Priority, ProfileCatalog, QosProfile, Reliability},
    stats::Stats,
};

/// Payload prefix marking an integrity-handshake response. Never confused
/// with application data: real payloads are handed to [`MessageHandler`]
/// only after this prefix has been stripped and verified.
const RESPONSE_MARKER: &[u8] = b"IRSP";

/// Every `CLEANUP_INTERVAL_TICKS` ticks, bans and integrity challenges are
/// swept for expiry.
const CLEANUP_INTERVAL_TICKS: u64 = 300;

/// Receives fully validated, in-order application payloads.
pub trait MessageHandler {
    /// Called once per delivered payload, in delivery order.
    fn on_message(&mut self, payload: &[u8], peer: SocketAddr, client_id: &str, header: &PacketHeader);
}

/// Blanket impl so a plain closure can be used as a handler.
impl<F: FnMut(&[u8], SocketAddr, &str, &PacketHeader)> MessageHandler for F {
    fn on_message(&mut self, payload: &[u8], peer: SocketAddr, client_id: &str, header: &PacketHeader) {
        self(payload, peer, client_id, header);
    }
}

/// Owns the non-blocking UDP socket, the connection table, and the
/// process-wide admission and integrity state.
///
/// Single-threaded and cooperative: [`Dispatcher::tick`] is the only
/// entry point that mutates anything, so no internal locking is needed.
pub struct Dispatcher {
    socket: UdpSocket,
    config: Config,
    connections: AHashMap<SocketAddr, Connection>,
    admission: AdmissionTables,
    integrity: IntegrityHandshake,
    profiles: ProfileCatalog,
    conditioner: Option<NetworkConditioner>,
    compression: Option<Box<dyn CompressionCodec>>,
    encryption: Option<Box<dyn EncryptionCodec>>,
    hwid_gate: Option<Box<dyn HwidGate>>,
    integrity_oracle: Option<Box<dyn IntegrityOracle>>,
    suspicious_filter: Option<Box<dyn SuspiciousPayloadFilter>>,
    hwid_pending: AHashSet<SocketAddr>,
    tick_count: u64,
    last_tick_at: Option<Instant>,
}

impl Dispatcher {
    /// Binds a non-blocking UDP socket on `config.port` and returns an
    /// otherwise empty dispatcher.
    ///
    /// # Errors
    ///
    /// Propagates any I/O error from binding or from enabling non-blocking
    /// mode.
    pub fn bind(config: Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let socket = UdpSocket::bind(("0.0.0.0", config.port))?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            config,
            connections: AHashMap::new(),
            admission: AdmissionTables::new(),
            integrity: IntegrityHandshake::new(),
            profiles: ProfileCatalog::default(),
            conditioner: None,
            compression: None,
            encryption: None,
            hwid_gate: None,
            integrity_oracle: None,
            suspicious_filter: None,
            hwid_pending: AHashSet::new(),
            tick_count: 0,
            last_tick_at: None,
        })
    }

    /// Installs a network-condition simulator on both inbound and outbound
    /// traffic. Test-only; never install this in a release deployment.
    pub fn with_conditioner(&mut self, conditioner: NetworkConditioner) -> &mut Self {
        self.conditioner = Some(conditioner);
        self
    }

    /// Installs the compression codec applied to profiles with
    /// `compression: true`.
    pub fn with_compression(&mut self, codec: Box<dyn CompressionCodec>) -> &mut Self {
        self.compression = Some(codec);
        self
    }

    /// Installs the encryption codec applied to profiles with
    /// `encryption: true`.
    pub fn with_encryption(&mut self, codec: Box<dyn EncryptionCodec>) -> &mut Self {
        self.encryption = Some(codec);
        self
    }

    /// Installs the HWID ban list consulted after the first successful
    /// integrity verification.
    pub fn with_hwid_gate(&mut self, gate: Box<dyn HwidGate>) -> &mut Self {
        self.hwid_gate = Some(gate);
        self
    }

    /// Installs the challenge/response oracle backing the integrity
    /// handshake. Without one, no challenges are ever issued.
    pub fn with_integrity_oracle(&mut self, oracle: Box<dyn IntegrityOracle>) -> &mut Self {
        self.integrity_oracle = Some(oracle);
        self
    }

    /// Installs an opt-in predicate for rejecting suspicious payloads before
    /// they reach a connection's reliability layer.
    pub fn with_suspicious_filter(&mut self, filter: Box<dyn SuspiciousPayloadFilter>) -> &mut Self {
        self.suspicious_filter = Some(filter);
        self
    }

    /// Mutable access to the QoS profile catalog, for registering or
    /// replacing custom profiles.
    pub fn profiles_mut(&mut self) -> &mut ProfileCatalog {
        &mut self.profiles
    }

    /// Current aggregate counters, folded from every live connection.
    #[must_use]
    pub fn stats(&self) -> Stats {
        let mut total = self.connections.values().fold(Stats::default(), |mut acc, conn| {
            acc.bytes_sent += conn.stats.bytes_sent;
            acc.bytes_received += conn.stats.bytes_received;
            acc.packets_sent += conn.stats.packets_sent;
            acc.packets_received += conn.stats.packets_received;
            acc.packets_lost += conn.stats.packets_lost;
            acc
        });
        total.connected_clients = self.connections.len() as u64;

        let samples: Vec<f64> = self
            .connections
            .values()
            .filter_map(Connection::average_rtt)
            .map(|rtt| rtt.as_secs_f64() * 1000.0)
            .collect();
        if !samples.is_empty() {
            total.average_latency_ms = samples.iter().sum::<f64>() / samples.len() as f64;
        }
        total
    }

    /// Number of currently tracked connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends `payload` to `peer` under the named QoS profile, creating a
    /// connection if one doesn't exist yet. Applies compression/encryption
    /// (if codecs are installed and the profile asks for them) before
    /// handing off to the connection's reliability layer.
    ///
    /// # Errors
    ///
    /// Propagates socket I/O errors.
    pub fn send(&mut self, peer: SocketAddr, payload: &[u8], profile_name: &str) -> io::Result<()> {
        let now_ms = now_ms();
        let now_secs = now_secs();
        let profile = self.profiles.get(profile_name);
        self.send_with_profile(peer, payload, &profile, now_ms, now_secs)
    }

    fn send_with_profile(
        &mut self,
        peer: SocketAddr,
        payload: &[u8],
        profile: &QosProfile,
        now_ms: u64,
        now_secs: u64,
    ) -> io::Result<()> {
        let mut flags = PacketFlags::empty();
        let mut data = payload.to_vec();

        if profile.compression {
            if let Some(codec) = &self.compression {
                data = codec.compress(&data).map_err(to_io_error)?;
                flags |= PacketFlags::COMPRESSED;
            }
        }
        if profile.encryption {
            if let Some(codec) = &self.encryption {
                data = codec.encrypt(&data).map_err(to_io_error)?;
                flags |= PacketFlags::ENCRYPTED;
            }
        }

        if !self.connections.contains_key(&peer) {
            self.admission.record_connection(peer.ip(), now_ms);
            self.connections.insert(peer, Connection::new(peer, now_ms));
        }
        let packets = self
            .connections
            .get_mut(&peer)
            .expect("just inserted above")
            .send(&data, profile, flags, now_ms, now_secs);

        for packet in packets {
            self.transmit(peer, &packet, now_ms)?;
        }
        Ok(())
    }

    /// Sends `payload` under the named profile to every currently connected
    /// peer.
    ///
    /// # Errors
    ///
    /// Propagates the first socket I/O error encountered.
    pub fn broadcast(&mut self, payload: &[u8], profile_name: &str) -> io::Result<()> {
        let profile = self.profiles.get(profile_name);
        let peers: Vec<SocketAddr> = self.connections.keys().copied().collect();
        let now_ms = now_ms();
        let now_secs = now_secs();
        for peer in peers {
            self.send_with_profile(peer, payload, &profile, now_ms, now_secs)?;
        }
        Ok(())
    }

    /// Gracefully disconnects `peer`: enqueues a reliable DISCONNECT
    /// notification and tears down its state once flushed on a later tick.
    pub fn disconnect(&mut self, peer: SocketAddr) {
        if let Some(conn) = self.connections.get_mut(&peer) {
            let now_ms = now_ms();
            let now_secs = now_secs();
            let packet = conn.begin_disconnect(now_ms, now_secs);
            let _ = self.transmit(peer, &packet, now_ms);
        }
    }

    /// Runs one dispatcher tick: drains pending datagrams (bounded by
    /// `recv_budget`), drives per-connection retransmit and keep-alive, and
    /// periodically sweeps expired bans and challenges.
    ///
    /// # Errors
    ///
    /// Propagates socket I/O errors other than `WouldBlock`.
    pub fn tick(&mut self, handler: &mut dyn MessageHandler, recv_budget: Duration) -> io::Result<()> {
        let now_ms = now_ms();
        let now_secs = now_secs();

        let now_instant = Instant::now();
        let elapsed = now_instant.duration_since(self.last_tick_at.unwrap_or(now_instant));
        self.last_tick_at = Some(now_instant);
        self.admission.refill(elapsed);

        self.drain_datagrams(handler, now_ms, now_secs, recv_budget)?;
        self.drive_connections(now_ms, now_secs);

        self.tick_count += 1;
        if self.tick_count % CLEANUP_INTERVAL_TICKS == 0 {
            self.admission.sweep(now_ms);
            self.integrity.sweep_expired(now_ms, self.config.integrity_check_interval_s * 1000);
        }
        Ok(())
    }

    fn drain_datagrams(
        &mut self,
        handler: &mut dyn MessageHandler,
        now_ms: u64,
        now_secs: u64,
        recv_budget: Duration,
    ) -> io::Result<()> {
        let deadline = Instant::now() + recv_budget;
        let mut buf = vec![0u8; packet::MAX_SIZE];
        loop {
            if Instant::now() > deadline {
                break;
            }
            match self.socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    let datagram = buf[..len].to_vec();
                    self.handle_datagram(&datagram, peer, now_ms, now_secs, handler);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_datagram(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        now_ms: u64,
        now_secs: u64,
        handler: &mut dyn MessageHandler,
    ) {
        let client_id = peer.to_string();

        let conditioned = if let Some(conditioner) = self.conditioner.as_mut() {
            match conditioner.process(datagram, now_ms) {
                Outcome::Drop => return,
                Outcome::Pass { bytes, .. } => bytes,
                Outcome::PassDuplicated { bytes, duplicate, .. } => {
                    self.process_admitted(&duplicate, peer, &client_id, now_ms, now_secs, handler);
                    bytes
                }
            }
        } else {
            datagram.to_vec()
        };

        self.process_admitted(&conditioned, peer, &client_id, now_ms, now_secs, handler);
    }

    fn process_admitted(
        &mut self,
        datagram: &[u8],
        peer: SocketAddr,
        client_id: &str,
        now_ms: u64,
        now_secs: u64,
        handler: &mut dyn MessageHandler,
    ) {
        let deadline = Instant::now() + Duration::from_secs_f64(self.config.max_packet_processing_time_s);
        let is_new_peer = !self.connections.contains_key(&peer);
        let queue_len = self
            .connections
            .get(&peer)
            .map_or(0, Connection::queued_packet_count);

        match self
            .admission
            .gate(client_id, peer.ip(), datagram.len(), is_new_peer, queue_len, &self.config, now_ms)
        {
            AdmissionOutcome::Admit => {}
            AdmissionOutcome::Drop => return,
            AdmissionOutcome::Ban(reason) => {
                warn!(%client_id, reason, "admission denied, sender banned");
                self.evict_connection(peer, client_id);
                return;
            }
        }

        if is_new_peer && self.connections.len() >= self.config.max_connections {
            debug!(%client_id, "dropping new connection, at max_connections capacity");
            return;
        }

        if Instant::now() > deadline {
            warn!(%client_id, "processing deadline exceeded before decode, aborting packet");
            return;
        }

        let (header, payload) = match packet::decode(datagram, now_secs) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!(%client_id, error = %e, "dropping malformed packet");
                return;
            }
        };

        if let Some(filter) = &self.suspicious_filter {
            if filter.is_suspicious(&payload) {
                warn!(%client_id, "suspicious payload pattern detected");
                return;
            }
        }

        if let Some(response) = payload.strip_prefix(RESPONSE_MARKER) {
            self.handle_integrity_response(peer, client_id, response, now_ms);
            return;
        }

        if is_new_peer {
            self.admission.record_connection(peer.ip(), now_ms);
            self.connections.insert(peer, Connection::new(peer, now_ms));
        }

        if self.integrity.needs_challenge(client_id, now_ms, self.config.integrity_check_interval_s) {
            self.send_challenge(peer, client_id, now_ms, now_secs);
        }

        let Some(conn) = self.connections.get_mut(&peer) else {
            return;
        };
        conn.mark_connected();

        if let Err(e) = conn.check_replay(header.sequence) {
            debug!(%client_id, error = %e, "dropping replayed or out-of-window packet");
            return;
        }

        if Instant::now() > deadline {
            warn!(%client_id, "processing deadline exceeded before delivery, aborting packet");
            return;
        }

        match conn.receive(header, payload, now_ms, now_secs) {
            Ok(output) => {
                for ack in &output.ack_packets {
                    let _ = self.transmit(peer, ack, now_ms);
                }
                for delivery in output.deliveries {
                    let hwid_first_payload = self.hwid_pending.remove(&peer);
                    if hwid_first_payload && self.config.enable_hwid_ban {
                        if let Some(reject_reason) = self.check_hwid(peer, client_id, &delivery.payload) {
                            warn!(%client_id, reason = reject_reason, "rejected on hwid gate");
                            self.evict_connection(peer, client_id);
                            return;
                        }
                    }
                    handler.on_message(&delivery.payload, peer, client_id, &delivery.header);
                }
            }
            Err(e) => warn!(%client_id, error = %e, "fragment reassembly failed"),
        }
    }

    fn send_challenge(&mut self, peer: SocketAddr, client_id: &str, now_ms: u64, now_secs: u64) {
        let Some(oracle) = self.integrity_oracle.as_deref_mut() else {
            return;
        };
        let challenge = self.integrity.issue_challenge(client_id, oracle, now_ms);
        if self.config.enable_hwid_ban {
            self.hwid_pending.insert(peer);
        }
        if let Err(e) = self.send_with_profile(peer, &challenge, &QosProfile::SYSTEM, now_ms, now_secs) {
            warn!(%client_id, error = %e, "failed to send integrity challenge");
        }
    }

    fn handle_integrity_response(&mut self, peer: SocketAddr, client_id: &str, response: &[u8], now_ms: u64) {
        let Some(oracle) = self.integrity_oracle.as_deref() else {
            return;
        };
        let outcome = self
            .integrity
            .handle_response(client_id, response, oracle, self.config.max_integrity_failures, now_ms);
        match outcome {
            IntegrityOutcome::Verified => info!(%client_id, "integrity check passed"),
            IntegrityOutcome::Failed => debug!(%client_id, "integrity check failed, retrying allowed"),
            IntegrityOutcome::NoPendingChallenge => debug!(%client_id, "integrity response with no pending challenge"),
            IntegrityOutcome::BanThreshold => {
                warn!(%client_id, "integrity failures exceeded threshold");
                let reason = self.admission.ban(client_id, "integrity violations", &self.config, now_ms);
                debug_assert!(matches!(reason, AdmissionOutcome::Ban(_)));
                self.evict_connection(peer, client_id);
            }
        }
    }

    fn check_hwid(&mut self, _peer: SocketAddr, client_id: &str, payload: &[u8]) -> Option<&'static str> {
        let hwid = String::from_utf8_lossy(payload).into_owned();
        let Some(gate) = self.hwid_gate.as_deref_mut() else {
            return None;
        };
        self.integrity
            .check_hwid(client_id, &hwid, gate, self.config.allow_virtual_machine)
            .err()
    }

    fn evict_connection(&mut self, peer: SocketAddr, client_id: &str) {
        if self.connections.remove(&peer).is_some() {
            self.admission.record_disconnection(peer.ip());
        }
        self.integrity.forget(client_id);
        self.hwid_pending.remove(&peer);
    }

    fn drive_connections(&mut self, now_ms: u64, now_secs: u64) {
        let mut outbound = Vec::new();
        let mut to_remove = Vec::new();

        for (&peer, conn) in &mut self.connections {
            if conn.state != ConnectionState::Disconnecting && conn.is_timed_out(now_ms, self.config.connection_timeout_ms) {
                info!(client_id = %conn.client_id, "connection timed out");
                to_remove.push(peer);
                continue;
            }

            for packet in conn.tick_retransmit(now_ms, now_secs) {
                outbound.push((peer, packet));
            }

            if conn.needs_keep_alive(now_ms, self.config.keep_alive_interval_ms) {
                let keep_alive = QosProfile {
                    reliability: Reliability::Unreliable,
                    priority: Priority::Lowest,
                    ..QosProfile::DEFAULT
                };
                for packet in conn.send(b"KEEPALIVE", &keep_alive, PacketFlags::empty(), now_ms, now_secs) {
                    outbound.push((peer, packet));
                }
            }

            conn.evict_expired_fragments(now_ms, self.config.fragment_timeout_ms);

            if conn.is_drained() {
                to_remove.push(peer);
            }
        }

        for (peer, packet) in outbound {
            let _ = self.transmit(peer, &packet, now_ms);
        }
        for peer in to_remove {
            self.evict_connection(peer, &peer.to_string());
        }
    }

    fn transmit(&mut self, peer: SocketAddr, bytes: &Bytes, now_ms: u64) -> io::Result<()> {
        match self.conditioner.as_mut() {
            None => {
                self.socket.send_to(bytes, peer)?;
            }
            Some(conditioner) => match conditioner.process(bytes, now_ms) {
                Outcome::Drop => {}
                Outcome::Pass { bytes, .. } => {
                    self.socket.send_to(&bytes, peer)?;
                }
                Outcome::PassDuplicated { bytes, duplicate, .. } => {
                    self.socket.send_to(&bytes, peer)?;
                    self.socket.send_to(&duplicate, peer)?;
                }
            },
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn to_io_error(e: crate::codecs::CodecError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::QosProfile;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn stats_averages_latency_only_across_connections_with_a_sample() {
        let mut config = Config::default();
        config.port = 0;
        let mut dispatcher = Dispatcher::bind(config).expect("loopback bind");

        let mut with_sample = Connection::new(peer(7100), 0);
        let mut probe = Connection::new(peer(7101), 0);
        let packets = with_sample.send(b"ping", &QosProfile::DEFAULT, PacketFlags::empty(), 0, 0);
        let (header, payload) = packet::decode(&packets[0], 0).expect("valid frame");
        probe.check_replay(header.sequence).expect("fresh sequence accepted");
        let received = probe.receive(header, payload, 0, 0).expect("no fragment error");
        let (ack_header, ack_payload) = packet::decode(&received.ack_packets[0], 0).expect("valid ack frame");
        with_sample
            .receive(ack_header, ack_payload, 20, 0)
            .expect("ack is never a fragment error");
        assert!(with_sample.average_rtt().is_some());

        let without_sample = Connection::new(peer(7102), 0);
        assert!(without_sample.average_rtt().is_none());

        dispatcher.connections.insert(peer(7100), with_sample);
        dispatcher.connections.insert(peer(7102), without_sample);

        let stats = dispatcher.stats();
        assert_eq!(stats.connected_clients, 2);
        assert!((stats.average_latency_ms - 20.0).abs() < f64::EPSILON);
    }
}
