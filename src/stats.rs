//! Observable transport counters. See [`Stats`].

use derive_more::{Add, AddAssign};

/// Aggregate counters for the whole dispatcher, accumulated since it was
/// created.
///
/// Combines with `+`/`+=` like the per-connection counters it is built from,
/// so the dispatcher can fold every connection's contribution into one
/// snapshot without a manual field-by-field sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Add, AddAssign)]
pub struct Stats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub connected_clients: u64,
    /// Mean of every currently-connected peer's smoothed round-trip time, in
    /// milliseconds. `0.0` if no connection has an RTT sample yet.
    ///
    /// Not folded via `+=` like the other fields: it is an average, not a
    /// sum, so the dispatcher sets it directly after folding the rest.
    pub average_latency_ms: f64,
}

impl Stats {
    /// Fraction of sent reliable packets that were never acknowledged and
    /// had to be given up on, in `[0.0, 1.0]`.
    #[must_use]
    pub fn packet_loss(&self) -> f64 {
        if self.packets_sent == 0 {
            0.0
        } else {
            self.packets_lost as f64 / self.packets_sent as f64
        }
    }
}

/// Per-connection counters, folded into the dispatcher-wide [`Stats`] on
/// each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Add, AddAssign)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
}

impl From<ConnectionStats> for Stats {
    fn from(c: ConnectionStats) -> Self {
        Self {
            bytes_sent: c.bytes_sent,
            bytes_received: c.bytes_received,
            packets_sent: c.packets_sent,
            packets_received: c.packets_received,
            packets_lost: c.packets_lost,
            connected_clients: 0,
            average_latency_ms: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_accumulate_via_add_assign() {
        let mut total = Stats::default();
        total += Stats {
            bytes_sent: 10,
            packets_sent: 1,
            ..Default::default()
        };
        total += Stats {
            bytes_sent: 5,
            packets_sent: 1,
            packets_lost: 1,
            ..Default::default()
        };
        assert_eq!(total.bytes_sent, 15);
        assert_eq!(total.packets_sent, 2);
        assert!((total.packet_loss() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_packets_sent_has_zero_loss() {
        assert_eq!(Stats::default().packet_loss(), 0.0);
    }
}
