//! Token bucket arithmetic.
//!
//! Bucket state is kept in integer milli-tokens so that every backend (the Valkey
//! function library and the in-process store) computes bit-identical results.
//! Refill uses floor division, so rounding can only ever withhold a fraction of a
//! milli-token and never creates one.
//!
//! `last_refill_us` only advances when at least one milli-token was credited or the
//! bucket was already full. Callers that hit a bucket faster than one milli-token per
//! interval therefore still accumulate elapsed time instead of resetting it.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};

pub const MILLI_TOKENS_PER_TOKEN: i64 = 1_000;
const MICROS_PER_SECOND: i128 = 1_000_000;

/// Stable reference to an external key record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub i64);

impl Display for KeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for KeyId {
    fn from(id: i64) -> Self {
        KeyId(id)
    }
}

/// Capacity and refill rate for a bucket, in milli-tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BucketParams {
    pub capacity_milli: i64,
    pub refill_milli_per_sec: i64,
}

impl BucketParams {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity_milli: i64::from(capacity) * MILLI_TOKENS_PER_TOKEN,
            refill_milli_per_sec: tokens_to_milli(refill_rate),
        }
    }

    pub fn capacity(&self) -> f64 {
        milli_to_tokens(self.capacity_milli)
    }

    pub fn refill_rate(&self) -> f64 {
        milli_to_tokens(self.refill_milli_per_sec)
    }
}

pub fn tokens_to_milli(tokens: f64) -> i64 {
    (tokens * MILLI_TOKENS_PER_TOKEN as f64).round() as i64
}

pub fn milli_to_tokens(milli: i64) -> f64 {
    milli as f64 / MILLI_TOKENS_PER_TOKEN as f64
}

/// Converts a requested whole-token count into milli-tokens, rejecting zero.
pub fn requested_milli(requested_tokens: u32) -> Result<i64, Error> {
    if requested_tokens == 0 {
        return Err(Error::new(ErrorDetails::InvalidRequest {
            message: "requested tokens must be a positive integer".to_string(),
        }));
    }
    Ok(i64::from(requested_tokens) * MILLI_TOKENS_PER_TOKEN)
}

/// Persisted state of one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketState {
    pub capacity: i64,
    pub tokens: i64,
    pub refill_rate: i64,
    pub last_refill_us: i64,
}

impl BucketState {
    /// A freshly created bucket starts at full capacity.
    pub fn full(params: BucketParams, now_us: i64) -> Self {
        Self {
            capacity: params.capacity_milli,
            tokens: params.capacity_milli,
            refill_rate: params.refill_milli_per_sec,
            last_refill_us: now_us,
        }
    }

    pub fn refill(&mut self, now_us: i64) {
        let elapsed = now_us - self.last_refill_us;
        if elapsed <= 0 {
            // Clock went backwards or no time passed
            return;
        }
        if self.tokens >= self.capacity {
            self.tokens = self.capacity;
            self.last_refill_us = now_us;
            return;
        }
        let added = i128::from(elapsed) * i128::from(self.refill_rate) / MICROS_PER_SECOND;
        if added > 0 {
            let room = i128::from(self.capacity - self.tokens);
            self.tokens += added.min(room) as i64;
            self.last_refill_us = now_us;
        }
    }

    /// Refills, then consumes `requested` milli-tokens if available.
    /// The refill is kept even when the consume fails.
    pub fn refill_and_try_consume(&mut self, requested: i64, now_us: i64) -> bool {
        self.refill(now_us);
        if self.tokens >= requested {
            self.tokens -= requested;
            true
        } else {
            false
        }
    }

    /// Applies new parameters, clamping tokens into the new capacity.
    pub fn reconfigure(&mut self, params: BucketParams, now_us: i64) {
        self.refill(now_us);
        self.capacity = params.capacity_milli;
        self.refill_rate = params.refill_milli_per_sec;
        self.tokens = self.tokens.min(self.capacity);
    }

    pub fn reset(&mut self, params: BucketParams, now_us: i64) {
        *self = Self::full(params, now_us);
    }

    pub fn snapshot(&self, key_id: KeyId) -> BucketSnapshot {
        BucketSnapshot {
            key_id,
            capacity: milli_to_tokens(self.capacity),
            tokens: milli_to_tokens(self.tokens),
            refill_rate: milli_to_tokens(self.refill_rate),
            last_refill_at: micros_to_datetime(self.last_refill_us),
        }
    }
}

/// Read-only view of a bucket at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BucketSnapshot {
    pub key_id: KeyId,
    pub capacity: f64,
    pub tokens: f64,
    pub refill_rate: f64,
    pub last_refill_at: DateTime<Utc>,
}

impl BucketSnapshot {
    pub fn utilization_percent(&self) -> f64 {
        if self.capacity <= 0.0 {
            return 0.0;
        }
        (self.capacity - self.tokens) / self.capacity * 100.0
    }

    pub fn is_depleted(&self) -> bool {
        self.tokens < 1.0
    }
}

pub fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(micros).unwrap_or_default()
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: i64 = 1_000_000;

    fn ten_per_one() -> BucketParams {
        BucketParams::new(10, 1.0)
    }

    #[test]
    fn test_params_conversion() {
        let params = BucketParams::new(20, 2.0);
        assert_eq!(params.capacity_milli, 20_000);
        assert_eq!(params.refill_milli_per_sec, 2_000);
        assert!((params.capacity() - 20.0).abs() < f64::EPSILON);
        assert!((params.refill_rate() - 2.0).abs() < f64::EPSILON);

        let slow = BucketParams::new(5, 0.5);
        assert_eq!(slow.refill_milli_per_sec, 500);
    }

    #[test]
    fn test_requested_milli_rejects_zero() {
        let err = requested_milli(0).unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::InvalidRequest { .. }
        ));
        assert_eq!(requested_milli(3).unwrap(), 3_000);
    }

    #[test]
    fn test_scenario_ten_consumes_then_refill() {
        let mut bucket = BucketState::full(ten_per_one(), 0);
        for i in 0..10 {
            assert!(
                bucket.refill_and_try_consume(1_000, 0),
                "consume {i} at t=0 should succeed"
            );
        }
        assert_eq!(bucket.tokens, 0);
        assert!(
            !bucket.refill_and_try_consume(1_000, 0),
            "11th consume at t=0 should fail"
        );
        assert!(bucket.refill_and_try_consume(1_000, 5 * SECOND));
        assert_eq!(bucket.tokens, 4_000, "5 refilled, 1 consumed, 4 remain");
    }

    #[test]
    fn test_conservation_without_refill() {
        let mut bucket = BucketState::full(BucketParams::new(50, 0.0), 0);
        let mut successes = 0;
        for _ in 0..80 {
            if bucket.refill_and_try_consume(1_000, 10 * SECOND) {
                successes += 1;
            }
            assert!(bucket.tokens >= 0, "tokens must never go negative");
        }
        assert_eq!(successes, 50);
        assert_eq!(bucket.tokens, 0);
    }

    #[test]
    fn test_capacity_bound_after_long_idle() {
        let mut bucket = BucketState::full(ten_per_one(), 0);
        assert!(bucket.refill_and_try_consume(3_000, 0));
        bucket.refill(365 * 24 * 3600 * SECOND);
        assert_eq!(bucket.tokens, bucket.capacity);
    }

    #[test]
    fn test_failed_consume_keeps_refill() {
        let mut bucket = BucketState::full(ten_per_one(), 0);
        assert!(bucket.refill_and_try_consume(10_000, 0));
        assert!(!bucket.refill_and_try_consume(5_000, 2 * SECOND));
        assert_eq!(bucket.tokens, 2_000);
        assert_eq!(bucket.last_refill_us, 2 * SECOND);
    }

    #[test]
    fn test_frequent_callers_still_accumulate() {
        let mut bucket = BucketState::full(BucketParams::new(10, 1.0), 0);
        assert!(bucket.refill_and_try_consume(10_000, 0));
        // 1 token/s is 1 milli-token per ms; polling every 100us credits nothing each time
        for step in 1..=10 {
            bucket.refill(step * 100);
        }
        assert_eq!(bucket.tokens, 1, "1ms of elapsed time must credit 1 milli-token");
    }

    #[test]
    fn test_clock_going_backwards_is_ignored() {
        let mut bucket = BucketState::full(ten_per_one(), 10 * SECOND);
        assert!(bucket.refill_and_try_consume(5_000, 10 * SECOND));
        bucket.refill(SECOND);
        assert_eq!(bucket.tokens, 5_000);
        assert_eq!(bucket.last_refill_us, 10 * SECOND);
    }

    #[test]
    fn test_reconfigure_clamps_tokens() {
        let mut bucket = BucketState::full(BucketParams::new(20, 2.0), 0);
        bucket.reconfigure(BucketParams::new(5, 0.5), 0);
        assert_eq!(bucket.capacity, 5_000);
        assert_eq!(bucket.tokens, 5_000);
        assert_eq!(bucket.refill_rate, 500);
    }

    #[test]
    fn test_snapshot_and_utilization() {
        let mut bucket = BucketState::full(ten_per_one(), 0);
        assert!(bucket.refill_and_try_consume(7_500, 0));
        let snapshot = bucket.snapshot(KeyId(3));
        assert!((snapshot.tokens - 2.5).abs() < f64::EPSILON);
        assert!((snapshot.utilization_percent() - 75.0).abs() < 1e-9);
        assert!(!snapshot.is_depleted());
        assert!(bucket.refill_and_try_consume(2_000, 0));
        assert!(bucket.snapshot(KeyId(3)).is_depleted());
    }
}
