//! Quality-of-service profiles: reliability, priority, and per-profile
//! fragmentation/retry/transform policy.
//!
//! See [`QosProfile`] and [`ProfileCatalog`].

use std::{collections::HashMap, time::Duration};

/// Delivery guarantee requested for a message sent under a [`QosProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reliability {
    /// No delivery or ordering guarantee.
    Unreliable = 0,
    /// No delivery guarantee; stale messages (older than the last delivered
    /// one) are dropped rather than delivered out of order.
    UnreliableSequenced = 1,
    /// Guaranteed delivery, no ordering guarantee.
    Reliable = 2,
    /// Guaranteed delivery, strict in-order delivery.
    ReliableOrdered = 3,
    /// Guaranteed delivery; stale messages are dropped rather than delivered
    /// out of order (like [`Reliability::UnreliableSequenced`], but with
    /// retransmission).
    ReliableSequenced = 4,
}

impl Reliability {
    /// Whether this reliability class requires an acknowledgement and
    /// retransmission.
    #[must_use]
    pub const fn is_reliable(self) -> bool {
        matches!(
            self,
            Self::Reliable | Self::ReliableOrdered | Self::ReliableSequenced
        )
    }

    /// Converts a wire byte into a reliability class.
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unreliable),
            1 => Some(Self::UnreliableSequenced),
            2 => Some(Self::Reliable),
            3 => Some(Self::ReliableOrdered),
            4 => Some(Self::ReliableSequenced),
            _ => None,
        }
    }
}

/// Relative send priority of a message. Higher priorities are flushed first
/// when a connection is bandwidth-limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    /// Lowest priority; sent only if nothing else is pending.
    Lowest = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Highest = 4,
    /// Reserved for protocol-internal traffic (acks, keep-alives, the
    /// integrity handshake).
    System = 5,
}

impl Priority {
    /// Converts a wire byte into a priority.
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Lowest),
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Highest),
            5 => Some(Self::System),
            _ => None,
        }
    }
}

/// Immutable quality-of-service descriptor.
///
/// Built-in profiles are created via [`QosProfile::DEFAULT`] etc; custom
/// profiles can be registered in a [`ProfileCatalog`] under their own name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosProfile {
    pub reliability: Reliability,
    pub priority: Priority,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_ms: u64,
    pub compression: bool,
    pub encryption: bool,
    pub fragment_size: usize,
    pub ordering_channel: u8,
    pub sequencing_channel: u8,
}

impl QosProfile {
    /// General-purpose reliable, compressed profile. Permanent; cannot be
    /// replaced in a [`ProfileCatalog`].
    pub const DEFAULT: Self = Self {
        reliability: Reliability::Reliable,
        priority: Priority::Normal,
        max_retries: 8,
        retry_delay_ms: 100,
        timeout_ms: 15_000,
        compression: true,
        encryption: false,
        fragment_size: 1024,
        ordering_channel: 0,
        sequencing_channel: 0,
    };

    /// Fire-and-forget, latency-sensitive profile for frequent updates (e.g.
    /// player positions).
    pub const REALTIME: Self = Self {
        reliability: Reliability::UnreliableSequenced,
        priority: Priority::High,
        max_retries: 0,
        retry_delay_ms: 0,
        timeout_ms: 0,
        compression: false,
        encryption: false,
        fragment_size: 1024,
        ordering_channel: 0,
        sequencing_channel: 1,
    };

    /// Protocol-internal traffic: acks, keep-alives, the integrity
    /// handshake. Permanent; cannot be replaced in a [`ProfileCatalog`].
    pub const SYSTEM: Self = Self {
        reliability: Reliability::ReliableOrdered,
        priority: Priority::System,
        max_retries: 5,
        retry_delay_ms: 200,
        timeout_ms: 10_000,
        compression: false,
        encryption: true,
        fragment_size: 1024,
        ordering_channel: 63,
        sequencing_channel: 63,
    };

    /// Large, low-priority transfers (e.g. level/asset streaming).
    pub const BULK: Self = Self {
        reliability: Reliability::Reliable,
        priority: Priority::Low,
        max_retries: 10,
        retry_delay_ms: 250,
        timeout_ms: 30_000,
        compression: true,
        encryption: false,
        fragment_size: 8 * 1024,
        ordering_channel: 1,
        sequencing_channel: 1,
    };

    /// Ordered, encrypted traffic for chat and similar player-authored
    /// content.
    pub const CHAT: Self = Self {
        reliability: Reliability::ReliableOrdered,
        priority: Priority::Normal,
        max_retries: 8,
        retry_delay_ms: 100,
        timeout_ms: 15_000,
        compression: false,
        encryption: true,
        fragment_size: 1024,
        ordering_channel: 2,
        sequencing_channel: 2,
    };

    /// Gets the retry delay for the given 1-based retry attempt, applying
    /// exponential backoff (`retry_delay_ms · 2^attempts`).
    #[must_use]
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let millis = self.retry_delay_ms.saturating_mul(1u64 << attempts.min(32));
        Duration::from_millis(millis)
    }

    /// Whether a payload of the given length must be fragmented under this
    /// profile.
    #[must_use]
    pub const fn needs_fragmentation(&self, payload_len: usize) -> bool {
        payload_len > self.fragment_size
    }

    /// Number of fragments a payload of the given length would be split
    /// into under this profile.
    #[must_use]
    pub const fn fragment_count(&self, payload_len: usize) -> usize {
        payload_len.div_ceil(self.fragment_size)
    }
}

/// Error returned by [`ProfileCatalog::remove`] when attempting to remove a
/// permanent profile, or by [`ProfileCatalog::add`] when attempting to
/// overwrite one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    /// `DEFAULT` and `SYSTEM` cannot be added, replaced, or removed.
    #[error("profile {0:?} is permanent and cannot be modified")]
    Permanent(&'static str),
}

/// Registry of named [`QosProfile`]s.
///
/// `DEFAULT` and `SYSTEM` are always present and immutable. Other names may
/// be freely added, replaced, or removed.
#[derive(Debug, Clone)]
pub struct ProfileCatalog {
    custom: HashMap<String, QosProfile>,
}

impl Default for ProfileCatalog {
    fn default() -> Self {
        let mut custom = HashMap::new();
        custom.insert("REALTIME".to_string(), QosProfile::REALTIME);
        custom.insert("BULK".to_string(), QosProfile::BULK);
        custom.insert("CHAT".to_string(), QosProfile::CHAT);
        Self { custom }
    }
}

impl ProfileCatalog {
    /// Creates a catalog with only the permanent profiles registered.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            custom: HashMap::new(),
        }
    }

    /// Looks up a profile by name, falling back to [`QosProfile::DEFAULT`]
    /// if `name` is not a permanent or registered profile.
    #[must_use]
    pub fn get(&self, name: &str) -> QosProfile {
        match name {
            "DEFAULT" => QosProfile::DEFAULT,
            "SYSTEM" => QosProfile::SYSTEM,
            other => self.custom.get(other).copied().unwrap_or(QosProfile::DEFAULT),
        }
    }

    /// Registers or replaces a named profile.
    ///
    /// # Errors
    ///
    /// Errors if `name` is `"DEFAULT"` or `"SYSTEM"`.
    pub fn add(&mut self, name: impl Into<String>, profile: QosProfile) -> Result<(), ProfileError> {
        let name = name.into();
        match name.as_str() {
            "DEFAULT" => Err(ProfileError::Permanent("DEFAULT")),
            "SYSTEM" => Err(ProfileError::Permanent("SYSTEM")),
            _ => {
                self.custom.insert(name, profile);
                Ok(())
            }
        }
    }

    /// Removes a named profile.
    ///
    /// # Errors
    ///
    /// Errors if `name` is `"DEFAULT"` or `"SYSTEM"`.
    pub fn remove(&mut self, name: &str) -> Result<(), ProfileError> {
        match name {
            "DEFAULT" => Err(ProfileError::Permanent("DEFAULT")),
            "SYSTEM" => Err(ProfileError::Permanent("SYSTEM")),
            other => {
                self.custom.remove(other);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_name_falls_back_to_default() {
        let catalog = ProfileCatalog::default();
        assert_eq!(catalog.get("nonexistent"), QosProfile::DEFAULT);
    }

    #[test]
    fn permanent_profiles_cannot_be_removed() {
        let mut catalog = ProfileCatalog::default();
        assert!(catalog.remove("DEFAULT").is_err());
        assert!(catalog.remove("SYSTEM").is_err());
    }

    #[test]
    fn custom_profile_can_be_replaced() {
        let mut catalog = ProfileCatalog::default();
        let mut custom = QosProfile::BULK;
        custom.max_retries = 99;
        catalog.add("BULK", custom).unwrap();
        assert_eq!(catalog.get("BULK").max_retries, 99);
    }

    #[test]
    fn retry_delay_backs_off_exponentially() {
        let profile = QosProfile::DEFAULT;
        assert_eq!(profile.retry_delay(0).as_millis(), 100);
        assert_eq!(profile.retry_delay(1).as_millis(), 200);
        assert_eq!(profile.retry_delay(3).as_millis(), 800);
    }

    #[test]
    fn fragment_count_rounds_up() {
        let profile = QosProfile::BULK;
        assert_eq!(profile.fragment_count(8192), 1);
        assert_eq!(profile.fragment_count(8193), 2);
    }
}
