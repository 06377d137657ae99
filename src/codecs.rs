//! External collaborator contracts: compression, encryption, HWID banning,
//! and the integrity oracle. These subsystems are out of scope for this
//! crate; it only defines the traits it calls through.

/// Opaque error from a [`CompressionCodec`] or [`EncryptionCodec`], boxed so
/// both traits stay object-safe regardless of the concrete codec backing
/// them.
#[derive(Debug, derive_more::Display, derive_more::Error)]
#[display("codec error: {_0}")]
pub struct CodecError(#[error(not(source))] pub Box<dyn std::error::Error + Send + Sync>);

/// Reversible payload compression, applied before encryption and before the
/// packet is checksummed.
pub trait CompressionCodec {
    /// Compresses `payload` for transmission.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverses [`CompressionCodec::compress`].
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Reversible symmetric encryption, applied after compression and before the
/// packet is checksummed.
pub trait EncryptionCodec {
    /// Encrypts `payload` for transmission.
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn encrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;

    /// Reverses [`EncryptionCodec::encrypt`]. Decoders apply this before
    /// [`CompressionCodec::decompress`].
    ///
    /// # Errors
    ///
    /// Implementation-defined.
    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// Opaque hardware-fingerprint ban list, consulted during the integrity
/// handshake when [`crate::config::Config::enable_hwid_ban`] is set.
pub trait HwidGate {
    /// Whether `id` is currently banned.
    fn is_banned(&self, id: &str) -> bool;

    /// Bans `id` with a human-readable reason.
    fn ban(&mut self, id: &str, reason: &str);

    /// Lifts a ban on `id`.
    fn unban(&mut self, id: &str);

    /// Whether the peer reporting `id` appears to be running inside a
    /// virtual environment.
    fn is_virtual_environment(&self, id: &str) -> bool;
}

/// Outcome of [`IntegrityOracle::verify_response`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityVerdict {
    /// The response matched the challenge.
    Verified,
    /// The response did not match, or was otherwise invalid.
    Failed,
}

/// Issues and verifies the challenge/response pair used to bootstrap a new
/// connection before it may exchange application data.
pub trait IntegrityOracle {
    /// Produces a fresh opaque challenge to send to a peer.
    fn create_challenge(&mut self) -> Vec<u8>;

    /// Verifies a peer's response against the challenge it was issued.
    fn verify_response(&self, challenge: &[u8], response: &[u8]) -> IntegrityVerdict;
}

/// Opt-in predicate flagging payloads with suspicious byte-level patterns
/// (script/SQL-like substrings, long runs of one character, single-byte
/// dominance above 40%).
///
/// Never invoked from the hot path unless a caller installs one; this is
/// deliberately separate from [`crate::packet::decode`] so the transport's
/// framing logic stays independent of any particular heuristic.
pub trait SuspiciousPayloadFilter {
    /// Returns `true` if `payload` looks suspicious and should be rejected.
    fn is_suspicious(&self, payload: &[u8]) -> bool;
}

/// Default heuristic implementing the patterns named in
/// [`SuspiciousPayloadFilter`]'s docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSuspiciousPayloadFilter;

impl SuspiciousPayloadFilter for DefaultSuspiciousPayloadFilter {
    fn is_suspicious(&self, payload: &[u8]) -> bool {
        const NEEDLES: &[&[u8]] = &[
            b"<script", b"SELECT ", b"DROP TABLE", b"UNION SELECT", b"--", b"/*",
        ];
        if NEEDLES.iter().any(|needle| contains(payload, needle)) {
            return true;
        }
        if has_long_run(payload, 32) {
            return true;
        }
        single_byte_dominance(payload) > 0.4
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w.eq_ignore_ascii_case(needle))
}

fn has_long_run(payload: &[u8], threshold: usize) -> bool {
    let mut run = 0usize;
    let mut prev: Option<u8> = None;
    for &b in payload {
        if Some(b) == prev {
            run += 1;
            if run >= threshold {
                return true;
            }
        } else {
            run = 1;
            prev = Some(b);
        }
    }
    false
}

fn single_byte_dominance(payload: &[u8]) -> f64 {
    if payload.is_empty() {
        return 0.0;
    }
    let mut counts = [0u32; 256];
    for &b in payload {
        counts[b as usize] += 1;
    }
    let max = counts.into_iter().max().unwrap_or(0);
    f64::from(max) / payload.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_script_tag() {
        let filter = DefaultSuspiciousPayloadFilter;
        assert!(filter.is_suspicious(b"hello <script>alert(1)</script>"));
    }

    #[test]
    fn flags_long_byte_run() {
        let filter = DefaultSuspiciousPayloadFilter;
        let payload = vec![b'a'; 64];
        assert!(filter.is_suspicious(&payload));
    }

    #[test]
    fn flags_single_byte_dominance() {
        let filter = DefaultSuspiciousPayloadFilter;
        let mut payload = vec![0u8; 100];
        payload[0..50].fill(1);
        assert!(filter.is_suspicious(&payload));
    }

    #[test]
    fn normal_payload_is_not_flagged() {
        let filter = DefaultSuspiciousPayloadFilter;
        assert!(!filter.is_suspicious(b"player moved to (1.0, 2.0, 3.0)"));
    }
}
