//! Challenge/response integrity handshake gating new and long-silent
//! connections. See [`IntegrityHandshake`].

use ahash::AHashMap;

use crate::codecs::{HwidGate, IntegrityOracle, IntegrityVerdict};

/// An issued challenge awaiting a response.
struct PendingChallenge {
    challenge: Vec<u8>,
    issued_at_ms: u64,
}

/// Outcome of feeding a response into [`IntegrityHandshake::handle_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityOutcome {
    /// The response verified; the peer may proceed.
    Verified,
    /// The response failed verification, but the failure budget has not
    /// been exhausted yet.
    Failed,
    /// The response failed and the peer has now exceeded
    /// `max_integrity_failures`; it must be banned.
    BanThreshold,
    /// No pending challenge existed for this client id; the response is
    /// dropped.
    NoPendingChallenge,
}

/// Per-dispatcher state for the integrity handshake: pending challenges,
/// failure counters, and the last successful check time per peer.
#[derive(Default)]
pub struct IntegrityHandshake {
    pending: AHashMap<String, PendingChallenge>,
    failures: AHashMap<String, u32>,
    last_check_ms: AHashMap<String, u64>,
    client_hwids: AHashMap<String, String>,
}

impl IntegrityHandshake {
    /// Creates empty handshake state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `client_id` needs a fresh challenge: either it has never
    /// passed one, or it has been silent for longer than
    /// `integrity_check_interval_s`.
    #[must_use]
    pub fn needs_challenge(&self, client_id: &str, now_ms: u64, interval_s: u64) -> bool {
        match self.last_check_ms.get(client_id) {
            None => !self.pending.contains_key(client_id),
            Some(last) => now_ms.saturating_sub(*last) > interval_s * 1000,
        }
    }

    /// Issues a challenge for `client_id` via `oracle`, storing it with the
    /// current time.
    pub fn issue_challenge(&mut self, client_id: &str, oracle: &mut dyn IntegrityOracle, now_ms: u64) -> Vec<u8> {
        let challenge = oracle.create_challenge();
        self.pending.insert(
            client_id.to_string(),
            PendingChallenge {
                challenge: challenge.clone(),
                issued_at_ms: now_ms,
            },
        );
        challenge
    }

    /// Verifies a response against the pending challenge for `client_id`.
    pub fn handle_response(
        &mut self,
        client_id: &str,
        response: &[u8],
        oracle: &dyn IntegrityOracle,
        max_failures: u32,
        now_ms: u64,
    ) -> IntegrityOutcome {
        let Some(pending) = self.pending.get(client_id) else {
            return IntegrityOutcome::NoPendingChallenge;
        };

        match oracle.verify_response(&pending.challenge, response) {
            IntegrityVerdict::Verified => {
                self.pending.remove(client_id);
                self.failures.remove(client_id);
                self.last_check_ms.insert(client_id.to_string(), now_ms);
                IntegrityOutcome::Verified
            }
            IntegrityVerdict::Failed => {
                self.pending.remove(client_id);
                let count = self.failures.entry(client_id.to_string()).or_insert(0);
                *count += 1;
                if *count >= max_failures {
                    IntegrityOutcome::BanThreshold
                } else {
                    IntegrityOutcome::Failed
                }
            }
        }
    }

    /// Removes expired pending challenges older than `timeout_ms`.
    pub fn sweep_expired(&mut self, now_ms: u64, timeout_ms: u64) {
        self.pending
            .retain(|_, p| now_ms.saturating_sub(p.issued_at_ms) <= timeout_ms);
    }

    /// Drops all state for `client_id` (on disconnect or ban).
    pub fn forget(&mut self, client_id: &str) {
        self.pending.remove(client_id);
        self.failures.remove(client_id);
        self.last_check_ms.remove(client_id);
        self.client_hwids.remove(client_id);
    }

    /// Applies the HWID gate to a newly admitted connection's first payload,
    /// interpreted as a hardware id.
    ///
    /// Returns `Err(reason)` if the connection must be rejected.
    pub fn check_hwid(
        &mut self,
        client_id: &str,
        hwid: &str,
        gate: &mut dyn HwidGate,
        allow_virtual_machine: bool,
    ) -> Result<(), &'static str> {
        if gate.is_banned(hwid) {
            gate.ban(hwid, "HWID banned");
            return Err("HWID banned");
        }
        if !allow_virtual_machine && gate.is_virtual_environment(hwid) {
            gate.ban(hwid, "virtual environment not allowed");
            return Err("virtual environment not allowed");
        }
        self.client_hwids.insert(client_id.to_string(), hwid.to_string());
        Ok(())
    }

    /// The HWID recorded for `client_id`, if any.
    #[must_use]
    pub fn hwid_for(&self, client_id: &str) -> Option<&str> {
        self.client_hwids.get(client_id).map(String::as_str)
    }
}
