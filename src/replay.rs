//! Per-connection replay protection. See [`ReplayWindow`].

use bitvec::prelude::{BitVec, Lsb0};

use crate::seq::Seq;

/// Number of sequence slots tracked by a [`ReplayWindow`].
pub const WINDOW_SIZE: u32 = 1024;

/// Largest forward or backward jump in sequence a single packet may make
/// relative to the window's `last_sequence` before being rejected outright.
pub const MAX_SEQUENCE_GAP: u32 = 10_000;

/// Outcome of submitting a sequence number to a [`ReplayWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    /// `|sequence - last_sequence| > MAX_SEQUENCE_GAP`.
    #[error("sequence gap exceeded MAX_SEQUENCE_GAP")]
    SequenceGapTooLarge,
    /// `sequence < window_start`: older than anything the window still
    /// tracks.
    #[error("sequence older than the replay window")]
    SequenceTooOld,
    /// The sequence's slot is already marked seen within the current window.
    #[error("sequence already seen")]
    Replay,
}

/// Sliding bitmap of recently seen sequence numbers, used to reject
/// duplicate and replayed packets.
///
/// One window exists per connection. Slots are indexed by `sequence mod
/// WINDOW_SIZE`; as `last_sequence` advances past `WINDOW_SIZE`, the window
/// slides forward and the slots it leaves behind are cleared, so a stale bit
/// can never be mistaken for a recent one.
#[derive(Debug, Clone)]
pub struct ReplayWindow {
    bitmap: BitVec<u32, Lsb0>,
    window_start: u32,
    last_sequence: u32,
    initialized: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    /// Creates an empty window. The first sequence submitted always sets
    /// `window_start = 0`, `last_sequence = sequence` and is accepted.
    #[must_use]
    pub fn new() -> Self {
        Self {
            bitmap: BitVec::repeat(false, WINDOW_SIZE as usize),
            window_start: 0,
            last_sequence: 0,
            initialized: false,
        }
    }

    /// Current lower bound of tracked sequences.
    #[must_use]
    pub const fn window_start(&self) -> u32 {
        self.window_start
    }

    /// Highest sequence accepted so far.
    #[must_use]
    pub const fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    fn slot(sequence: u32) -> usize {
        (sequence % WINDOW_SIZE) as usize
    }

    /// Checks and records `sequence`, returning an error if it must be
    /// rejected.
    ///
    /// # Errors
    ///
    /// See [`ReplayError`].
    pub fn check(&mut self, sequence: Seq) -> Result<(), ReplayError> {
        let sequence = sequence.0;

        if !self.initialized {
            self.initialized = true;
            self.window_start = 0;
            self.last_sequence = sequence;
            self.bitmap.set(Self::slot(sequence), true);
            return Ok(());
        }

        let gap = sequence.abs_diff(self.last_sequence);
        if gap > MAX_SEQUENCE_GAP {
            return Err(ReplayError::SequenceGapTooLarge);
        }
        if sequence < self.window_start {
            return Err(ReplayError::SequenceTooOld);
        }

        let slot = Self::slot(sequence);
        if self.bitmap[slot] && sequence >= self.window_start {
            return Err(ReplayError::Replay);
        }

        self.bitmap.set(slot, true);
        self.last_sequence = self.last_sequence.max(sequence);

        if sequence.saturating_sub(self.window_start) > WINDOW_SIZE {
            let new_start = sequence - WINDOW_SIZE;
            self.advance_window(new_start);
        }

        Ok(())
    }

    /// Clears every slot whose sequence falls below `new_start` and raises
    /// `window_start` to it.
    fn advance_window(&mut self, new_start: u32) {
        let retired = new_start.saturating_sub(self.window_start).min(WINDOW_SIZE);
        for offset in 0..retired {
            let seq = self.window_start.wrapping_add(offset);
            self.bitmap.set(Self::slot(seq), false);
        }
        self.window_start = new_start;
    }

    /// Whether this window has gone idle: no activity to evict, used by the
    /// dispatcher's periodic sweep to decide whether a connection's replay
    /// state is still live.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }
}
