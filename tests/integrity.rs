//! Three consecutive failed integrity responses hit the ban threshold on the
//! default `max_integrity_failures` of 3.

use gaffer::codecs::{IntegrityOracle, IntegrityVerdict};
use gaffer::config::Config;
use gaffer::integrity::{IntegrityHandshake, IntegrityOutcome};

struct AlwaysFailsOracle;

impl IntegrityOracle for AlwaysFailsOracle {
    fn create_challenge(&mut self) -> Vec<u8> {
        b"challenge".to_vec()
    }

    fn verify_response(&self, _challenge: &[u8], _response: &[u8]) -> IntegrityVerdict {
        IntegrityVerdict::Failed
    }
}

#[test]
fn three_consecutive_failures_trigger_ban_threshold() {
    let mut handshake = IntegrityHandshake::new();
    let mut oracle = AlwaysFailsOracle;
    let config = Config::default();
    assert_eq!(config.max_integrity_failures, 3);

    let mut last_outcome = None;
    for attempt in 0..config.max_integrity_failures {
        let now_ms = u64::from(attempt) * 1000;
        handshake.issue_challenge("peer:1", &mut oracle, now_ms);
        last_outcome = Some(handshake.handle_response(
            "peer:1",
            b"wrong-response",
            &oracle,
            config.max_integrity_failures,
            now_ms,
        ));
    }

    assert_eq!(last_outcome, Some(IntegrityOutcome::BanThreshold));
}
