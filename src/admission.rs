//! Process-wide admission gate: ban list, per-IP connection and packet rate
//! limits, and the queue-depth and processing-deadline checks every inbound
//! datagram passes through before it reaches [`crate::packet::decode`].
//!
//! Owned exclusively by the dispatcher; nothing else mutates these tables.

use std::{net::IpAddr, time::Duration};

use ahash::AHashMap;

use crate::{config::Config, limit::TokenBucket};

/// One hour, in seconds: how long an address is remembered in
/// `recently_unbanned` for stricter post-ban rate limiting.
const RECENTLY_UNBANNED_RETENTION_S: u64 = 3_600;

/// A peer is currently banned.
#[derive(Debug, Clone)]
struct Ban {
    expires_at_ms: u64,
    reason: String,
    ban_count: u32,
}

/// Outcome of [`AdmissionTables::gate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// The datagram may proceed to decoding.
    Admit,
    /// The datagram is dropped with no further action.
    Drop,
    /// The sender is now banned with the given reason; the datagram is
    /// dropped.
    Ban(String),
}

struct IpBurst {
    count: u32,
    window_start_ms: u64,
}

/// Process-wide state consulted by [`AdmissionTables::gate`] on every
/// inbound datagram, and mutated only from the dispatcher tick.
#[derive(Default)]
pub struct AdmissionTables {
    banned: AHashMap<String, Ban>,
    recently_unbanned: AHashMap<String, u64>,
    ip_connections: AHashMap<IpAddr, usize>,
    connection_attempts: AHashMap<IpAddr, u64>,
    connection_burst: AHashMap<IpAddr, IpBurst>,
    packet_buckets: AHashMap<IpAddr, TokenBucket>,
    packet_burst: AHashMap<IpAddr, IpBurst>,
}

impl AdmissionTables {
    /// Creates empty admission tables.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the full admission pipeline for a datagram of
    /// `datagram_len` bytes from `client_id` (`ip:port`), where `is_new_peer`
    /// indicates no [`crate::connection::Connection`] exists yet for this
    /// address, and `connection_queue_len` is that connection's current
    /// reliable-queue depth (`0` for new peers).
    pub fn gate(
        &mut self,
        client_id: &str,
        peer_ip: IpAddr,
        datagram_len: usize,
        is_new_peer: bool,
        connection_queue_len: usize,
        config: &Config,
        now_ms: u64,
    ) -> AdmissionOutcome {
        if let Some(outcome) = self.check_ban(client_id, now_ms) {
            return outcome;
        }

        if datagram_len > config.max_packet_size {
            return self.ban(client_id, "Oversized packet", config, now_ms);
        }

        if is_new_peer {
            if self.ip_connection_limit_reached(peer_ip, config) {
                return AdmissionOutcome::Drop;
            }
            if let Some(outcome) = self.check_connection_burst(peer_ip, config, now_ms) {
                return outcome;
            }
        }

        if let Some(outcome) = self.check_packet_rate(client_id, peer_ip, config, now_ms) {
            return outcome;
        }

        if connection_queue_len >= config.max_packet_queue_size {
            return self.ban(client_id, "Packet queue overflow", config, now_ms);
        }

        AdmissionOutcome::Admit
    }

    fn check_ban(&mut self, client_id: &str, now_ms: u64) -> Option<AdmissionOutcome> {
        match self.banned.get(client_id) {
            Some(ban) if ban.expires_at_ms > now_ms => Some(AdmissionOutcome::Drop),
            Some(_) => {
                self.banned.remove(client_id);
                self.recently_unbanned.insert(client_id.to_string(), now_ms);
                None
            }
            None => None,
        }
    }

    fn check_connection_burst(&mut self, ip: IpAddr, config: &Config, now_ms: u64) -> Option<AdmissionOutcome> {
        let window_ms = config.connection_burst_window_s * 1000;
        let burst = self.connection_burst.entry(ip).or_insert(IpBurst {
            count: 0,
            window_start_ms: now_ms,
        });
        if now_ms.saturating_sub(burst.window_start_ms) > window_ms {
            burst.count = 0;
            burst.window_start_ms = now_ms;
        }
        burst.count += 1;
        if burst.count > config.connection_burst_limit {
            let client_id = ip.to_string();
            return Some(self.ban(&client_id, "Connection burst exceeded", config, now_ms));
        }
        None
    }

    fn check_packet_rate(
        &mut self,
        client_id: &str,
        ip: IpAddr,
        config: &Config,
        now_ms: u64,
    ) -> Option<AdmissionOutcome> {
        let recently_unbanned = self.recently_unbanned.contains_key(client_id);
        let rate_cap = if recently_unbanned {
            config.max_packets_per_second / 2.0
        } else {
            config.max_packets_per_second
        };

        let bucket = self
            .packet_buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(rate_cap, rate_cap));
        if !bucket.try_consume(1.0) {
            return Some(self.ban(client_id, "Rate limit exceeded", config, now_ms));
        }

        let window_ms = config.packet_burst_window_s * 1000;
        let burst = self.packet_burst.entry(ip).or_insert(IpBurst {
            count: 0,
            window_start_ms: now_ms,
        });
        if now_ms.saturating_sub(burst.window_start_ms) > window_ms {
            burst.count = 0;
            burst.window_start_ms = now_ms;
        }
        burst.count += 1;
        if burst.count > config.packet_burst_limit {
            return Some(self.ban(client_id, "Rate limit exceeded", config, now_ms));
        }
        None
    }

    /// Bans `client_id`, escalating the duration linearly with how many
    /// times it has been banned before.
    pub fn ban(&mut self, client_id: &str, reason: &str, config: &Config, now_ms: u64) -> AdmissionOutcome {
        let ban_count = self.banned.get(client_id).map_or(0, |b| b.ban_count) + 1;
        let duration_ms = config.ban_duration_s.saturating_mul(u64::from(ban_count)) * 1000;
        self.banned.insert(
            client_id.to_string(),
            Ban {
                expires_at_ms: now_ms + duration_ms,
                reason: reason.to_string(),
                ban_count,
            },
        );
        AdmissionOutcome::Ban(reason.to_string())
    }

    /// Number of times `client_id` has been banned, or `0` if never.
    #[must_use]
    pub fn ban_count(&self, client_id: &str) -> u32 {
        self.banned.get(client_id).map_or(0, |b| b.ban_count)
    }

    /// Whether `client_id` is currently banned.
    #[must_use]
    pub fn is_banned(&self, client_id: &str) -> bool {
        self.banned.contains_key(client_id)
    }

    /// Ban expiry timestamp, if banned.
    #[must_use]
    pub fn ban_expires_at_ms(&self, client_id: &str) -> Option<u64> {
        self.banned.get(client_id).map(|b| b.expires_at_ms)
    }

    /// Ban reason, if banned.
    #[must_use]
    pub fn ban_reason(&self, client_id: &str) -> Option<&str> {
        self.banned.get(client_id).map(|b| b.reason.as_str())
    }

    /// Records that a new connection now exists for `ip`.
    pub fn record_connection(&mut self, ip: IpAddr, now_ms: u64) {
        *self.ip_connections.entry(ip).or_insert(0) += 1;
        self.connection_attempts.insert(ip, now_ms);
    }

    /// Records that a connection for `ip` was removed.
    pub fn record_disconnection(&mut self, ip: IpAddr) {
        if let Some(count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Current number of live connections from `ip`.
    #[must_use]
    pub fn connections_from(&self, ip: IpAddr) -> usize {
        self.ip_connections.get(&ip).copied().unwrap_or(0)
    }

    /// Whether `ip` is at or above `config.max_connections_per_ip`.
    #[must_use]
    pub fn ip_connection_limit_reached(&self, ip: IpAddr, config: &Config) -> bool {
        self.connections_from(ip) >= config.max_connections_per_ip
    }

    /// Sweeps expired bans and stale `recently_unbanned` entries. Called
    /// periodically from the dispatcher tick.
    pub fn sweep(&mut self, now_ms: u64) {
        self.banned.retain(|_, ban| ban.expires_at_ms > now_ms);
        let retention_ms = RECENTLY_UNBANNED_RETENTION_S * 1000;
        self.recently_unbanned
            .retain(|_, unbanned_at| now_ms.saturating_sub(*unbanned_at) <= retention_ms);
    }

    /// Refills every per-IP packet-rate token bucket. Called once per
    /// dispatcher tick.
    pub fn refill(&mut self, elapsed: Duration) {
        for bucket in self.packet_buckets.values_mut() {
            bucket.refill(elapsed.as_secs_f64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))
    }

    #[test]
    fn oversized_packet_is_banned() {
        let mut tables = AdmissionTables::new();
        let config = Config::default();
        let outcome = tables.gate("203.0.113.7:1", ip(), config.max_packet_size + 1, true, 0, &config, 0);
        assert!(matches!(outcome, AdmissionOutcome::Ban(reason) if reason == "Oversized packet"));
    }

    #[test]
    fn banned_sender_is_dropped_until_expiry() {
        let mut tables = AdmissionTables::new();
        let config = Config::default();
        tables.ban("203.0.113.7:1", "test", &config, 0);
        assert_eq!(tables.gate("203.0.113.7:1", ip(), 10, false, 0, &config, 1_000), AdmissionOutcome::Drop);
    }

    #[test]
    fn connection_burst_trips_after_limit() {
        let mut tables = AdmissionTables::new();
        let mut config = Config::default();
        config.connection_burst_limit = 3;
        for _ in 0..3 {
            let outcome = tables.gate("203.0.113.7:1", ip(), 10, true, 0, &config, 0);
            assert_eq!(outcome, AdmissionOutcome::Admit);
        }
        let outcome = tables.gate("203.0.113.7:1", ip(), 10, true, 0, &config, 0);
        assert!(matches!(outcome, AdmissionOutcome::Ban(_)));
        // connection-burst bans are recorded under the bare IP, not ip:port
        assert_eq!(tables.ban_count("203.0.113.7"), 1);
    }

    #[test]
    fn ip_connection_cap_drops_new_peers_over_the_limit() {
        let mut tables = AdmissionTables::new();
        let mut config = Config::default();
        config.max_connections_per_ip = 2;
        tables.record_connection(ip(), 0);
        tables.record_connection(ip(), 0);
        let outcome = tables.gate("203.0.113.7:2", ip(), 10, true, 0, &config, 0);
        assert_eq!(outcome, AdmissionOutcome::Drop);
    }

    #[test]
    fn queue_overflow_is_banned() {
        let mut tables = AdmissionTables::new();
        let config = Config::default();
        let outcome = tables.gate(
            "203.0.113.7:1",
            ip(),
            10,
            false,
            config.max_packet_queue_size,
            &config,
            0,
        );
        assert!(matches!(outcome, AdmissionOutcome::Ban(reason) if reason == "Packet queue overflow"));
    }

    #[test]
    fn ban_escalates_linearly() {
        let mut tables = AdmissionTables::new();
        let config = Config::default();
        tables.ban("a", "first", &config, 0);
        let first_expiry = tables.ban_expires_at_ms("a").unwrap();
        tables.sweep(first_expiry + 1);
        tables.ban("a", "second", &config, first_expiry + 1);
        let second_expiry = tables.ban_expires_at_ms("a").unwrap() - (first_expiry + 1);
        assert_eq!(second_expiry, config.ban_duration_s * 2 * 1000);
    }
}
