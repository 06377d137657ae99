//! Optional network-condition simulator: a pure transformer that may drop,
//! corrupt, delay, duplicate, or reject an outbound or inbound datagram.
//!
//! **For testing only.** Modeled on a conditioner that randomly drops and
//! delays messages; extended here with per-byte corruption, duplication,
//! and an MTU-rejection path, plus bandwidth accounting per one-second
//! window since this simulator sits on a byte-oriented transport rather
//! than a message-oriented one.

use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Configuration for a [`NetworkConditioner`].
///
/// All probabilities are clamped to `0.0..=1.0` when the conditioner is
/// built; this struct itself does not validate.
#[derive(Debug, Clone)]
pub struct ConditionerConfig {
    /// Chance a datagram is dropped outright.
    pub loss_rate: f32,
    /// Chance a datagram is duplicated (emitted twice).
    pub duplicate_rate: f32,
    /// Chance each individual byte is flipped.
    pub corrupt_byte_rate: f32,
    /// Mean artificial delay, in seconds.
    pub delay_mean: f32,
    /// Standard deviation of the artificial delay, in seconds.
    pub delay_std_dev: f32,
    /// Datagrams larger than this are rejected outright, simulating an MTU
    /// ceiling below the transport's own `MAX_SIZE`.
    pub mtu: usize,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_byte_rate: 0.0,
            delay_mean: 0.0,
            delay_std_dev: 0.0,
            mtu: usize::MAX,
        }
    }
}

/// What the caller should do with a datagram after [`NetworkConditioner::process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Pass the datagram through, possibly corrupted, after an optional
    /// delay hint (in milliseconds) the caller may queue or ignore.
    Pass { bytes: Vec<u8>, delay_ms: u64 },
    /// One or more extra copies should also be passed through, alongside
    /// the original.
    PassDuplicated { bytes: Vec<u8>, delay_ms: u64, duplicate: Vec<u8> },
    /// Drop the datagram. No reason is surfaced beyond this: the transport
    /// observes only drop or pass, per the simulator's pure-transformer
    /// contract.
    Drop,
}

/// Per-second bandwidth accounting. Tracks consumed bytes within the
/// current window without imposing a cap itself; callers can compare
/// against their own budget.
#[derive(Debug, Clone, Copy, Default)]
struct BandwidthWindow {
    window_start_ms: u64,
    bytes_this_window: u64,
}

impl BandwidthWindow {
    fn record(&mut self, now_ms: u64, len: usize) -> u64 {
        if now_ms.saturating_sub(self.window_start_ms) >= 1000 {
            self.window_start_ms = now_ms;
            self.bytes_this_window = 0;
        }
        self.bytes_this_window += len as u64;
        self.bytes_this_window
    }
}

/// Wraps outbound or inbound datagrams in artificial loss, corruption,
/// delay, and duplication, as a pure `process(bytes) -> Outcome`
/// transformer.
#[derive(Debug)]
pub struct NetworkConditioner {
    loss_rate: f32,
    duplicate_rate: f32,
    corrupt_byte_rate: f32,
    delay_distr: Normal<f32>,
    mtu: usize,
    bandwidth: BandwidthWindow,
}

impl NetworkConditioner {
    /// Builds a conditioner from `config`.
    ///
    /// # Panics
    ///
    /// Panics if `delay_std_dev` is not finite.
    #[must_use]
    pub fn new(config: &ConditionerConfig) -> Self {
        let delay_distr = Normal::new(config.delay_mean, config.delay_std_dev)
            .expect("delay_std_dev must be finite");
        Self {
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            duplicate_rate: config.duplicate_rate.clamp(0.0, 1.0),
            corrupt_byte_rate: config.corrupt_byte_rate.clamp(0.0, 1.0),
            delay_distr,
            mtu: config.mtu,
            bandwidth: BandwidthWindow::default(),
        }
    }

    /// Bytes observed within the current one-second accounting window.
    #[must_use]
    pub fn bandwidth_used(&self) -> u64 {
        self.bandwidth.bytes_this_window
    }

    /// Runs `datagram` through the configured conditions.
    pub fn process(&mut self, datagram: &[u8], now_ms: u64) -> Outcome {
        self.bandwidth.record(now_ms, datagram.len());

        if datagram.len() > self.mtu {
            return Outcome::Drop;
        }

        let mut rng = rand::thread_rng();
        if rng.gen::<f32>() < self.loss_rate {
            return Outcome::Drop;
        }

        let mut bytes = datagram.to_vec();
        if self.corrupt_byte_rate > 0.0 {
            for byte in &mut bytes {
                if rng.gen::<f32>() < self.corrupt_byte_rate {
                    *byte ^= 1 << rng.gen_range(0..8);
                }
            }
        }

        let delay_sec = self.delay_distr.sample(&mut rng).max(0.0);
        let delay_ms = (delay_sec * 1000.0) as u64;

        if rng.gen::<f32>() < self.duplicate_rate {
            let duplicate = bytes.clone();
            Outcome::PassDuplicated { bytes, delay_ms, duplicate }
        } else {
            Outcome::Pass { bytes, delay_ms }
        }
    }
}
