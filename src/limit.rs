//! Token-bucket rate limiting, used by [`crate::admission`] to cap how many
//! packets and bytes a peer may submit per second.
//!
//! Adapted from a byte-counting bucket: capacity refills over time rather
//! than being tied to a fixed tick rate, so the limit holds regardless of how
//! often [`TokenBucket::refill`] happens to be called.

/// A token bucket with a fixed capacity that refills at a constant rate.
///
/// [Token bucket]: https://en.wikipedia.org/wiki/Token_bucket
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    cap: f64,
    rem: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    /// Creates a bucket with capacity `cap`, starting full, refilling at
    /// `refill_per_sec` tokens per second.
    #[must_use]
    pub const fn new(cap: f64, refill_per_sec: f64) -> Self {
        Self {
            cap,
            rem: cap,
            refill_per_sec,
        }
    }

    /// Tokens currently available.
    #[must_use]
    pub fn remaining(&self) -> f64 {
        self.rem
    }

    /// Maximum number of tokens this bucket can hold.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.cap
    }

    /// Adds tokens proportional to the elapsed time, capped at `cap`.
    pub fn refill(&mut self, elapsed_secs: f64) {
        self.rem = self.cap.min(self.rem + self.refill_per_sec * elapsed_secs);
    }

    /// Attempts to take `n` tokens. Returns `true` and deducts them if
    /// enough are available, otherwise leaves the bucket untouched and
    /// returns `false`.
    pub fn try_consume(&mut self, n: f64) -> bool {
        if self.rem >= n {
            self.rem -= n;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumes_while_tokens_available() {
        let mut bucket = TokenBucket::new(10.0, 1.0);
        assert!(bucket.try_consume(10.0));
        assert!(!bucket.try_consume(1.0));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket::new(10.0, 5.0);
        bucket.try_consume(10.0);
        bucket.refill(100.0);
        assert_eq!(bucket.remaining(), 10.0);
    }

    #[test]
    fn refill_is_proportional_to_elapsed_time() {
        let mut bucket = TokenBucket::new(10.0, 2.0);
        bucket.try_consume(10.0);
        bucket.refill(1.0);
        assert_eq!(bucket.remaining(), 2.0);
    }
}
