//! Runtime configuration. See [`Config`].

/// All tunables for a [`crate::dispatcher::Dispatcher`].
///
/// Every field has a documented default matching [`Config::default`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// UDP port to bind.
    pub port: u16,
    /// Maximum simultaneous connections.
    pub max_connections: usize,
    /// Socket receive buffer size, in datagrams.
    pub buffer_size: usize,
    /// Largest accepted encoded packet, in bytes.
    pub max_packet_size: usize,
    /// Default fragmentation threshold, in bytes, for profiles that don't
    /// override it.
    pub fragment_size: usize,
    /// How long an incomplete fragment group is kept before eviction.
    pub fragment_timeout_ms: u64,
    /// How long a connection may go without inbound activity before it is
    /// disconnected with "Connection timeout".
    pub connection_timeout_ms: u64,
    /// Interval between keep-alive packets on an otherwise idle connection.
    pub keep_alive_interval_ms: u64,
    /// Seconds of silence from a known peer before it is re-challenged.
    pub integrity_check_interval_s: u64,
    /// Consecutive integrity failures before a peer is banned.
    pub max_integrity_failures: u32,
    /// Sustained per-IP packet rate before a ban.
    pub max_packets_per_second: f64,
    /// Minimum seconds between connection attempts from a fresh IP.
    pub connection_cooldown_s: u64,
    /// Maximum simultaneous connections from a single IP.
    pub max_connections_per_ip: usize,
    /// Packets within `packet_burst_window_s` before the burst bucket trips.
    pub packet_flood_threshold: u32,
    /// Base ban duration in seconds; scales linearly with `ban_count`.
    pub ban_duration_s: u64,
    /// Maximum packets a single connection may have queued before it is
    /// treated as abusive.
    pub max_packet_queue_size: usize,
    /// New connections allowed per IP within `connection_burst_window_s`.
    pub connection_burst_limit: u32,
    /// Window, in seconds, over which `connection_burst_limit` applies.
    pub connection_burst_window_s: u64,
    /// Packets allowed per IP within `packet_burst_window_s`.
    pub packet_burst_limit: u32,
    /// Window, in seconds, over which `packet_burst_limit` applies.
    pub packet_burst_window_s: u64,
    /// Wall-clock budget, in seconds, for processing a single inbound
    /// packet before it is aborted.
    pub max_packet_processing_time_s: f64,
    /// Whether the HWID gate is consulted during the integrity handshake.
    pub enable_hwid_ban: bool,
    /// Duration of a HWID ban, in seconds.
    pub hwid_ban_duration_s: u64,
    /// Whether peers reporting a virtual environment are allowed to
    /// connect.
    pub allow_virtual_machine: bool,
    /// Tick rate the dispatcher is driven at; governs keep-alive and
    /// retransmit cadence when callers use [`Config::tick_interval`].
    pub tick_rate_hz: u32,
}

/// Errors validating a [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    MustBePositive { field: &'static str },
    #[error("fragment_size must not exceed max_packet_size - HEADER_SIZE")]
    FragmentSizeTooLarge,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 12345,
            max_connections: 32,
            buffer_size: 1024,
            max_packet_size: 1024,
            fragment_size: 512,
            fragment_timeout_ms: 5_000,
            connection_timeout_ms: 30_000,
            keep_alive_interval_ms: 1_000,
            integrity_check_interval_s: 30,
            max_integrity_failures: 3,
            max_packets_per_second: 1_000.0,
            connection_cooldown_s: 5,
            max_connections_per_ip: 3,
            packet_flood_threshold: 100,
            ban_duration_s: 3_600,
            max_packet_queue_size: 1_000,
            connection_burst_limit: 10,
            connection_burst_window_s: 5,
            packet_burst_limit: 100,
            packet_burst_window_s: 1,
            max_packet_processing_time_s: 0.1,
            enable_hwid_ban: true,
            hwid_ban_duration_s: 7_776_000,
            allow_virtual_machine: false,
            tick_rate_hz: 60,
        }
    }
}

impl Config {
    /// Validates internal consistency.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(ConfigError::MustBePositive { field: "max_connections" });
        }
        if self.max_packet_size == 0 {
            return Err(ConfigError::MustBePositive { field: "max_packet_size" });
        }
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::MustBePositive { field: "tick_rate_hz" });
        }
        if self.fragment_size > self.max_packet_size.saturating_sub(crate::packet::HEADER_SIZE) {
            return Err(ConfigError::FragmentSizeTooLarge);
        }
        Ok(())
    }

    /// Interval between dispatcher ticks implied by `tick_rate_hz`.
    #[must_use]
    pub fn tick_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn fragment_size_over_budget_is_rejected() {
        let mut config = Config::default();
        config.fragment_size = config.max_packet_size;
        assert_eq!(config.validate().unwrap_err(), ConfigError::FragmentSizeTooLarge);
    }

    #[test]
    fn zero_max_connections_is_rejected() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }
}
