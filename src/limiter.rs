//! Reservation-style token bucket.
//!
//! [`RateLimiter`] is the pacing primitive behind both ceilings: the policer
//! keeps one for the whole server and every wrapped connection keeps its
//! own. A reservation debits tokens immediately and tells the caller how
//! long to sleep before the debt is covered, so concurrent reservers are
//! ordered by arrival rather than by who wakes first.
//!
//! Limiters are configured once at construction; a rate change replaces the
//! whole object (see the swap slots in [`crate::policer`] and
//! [`crate::conn`]). A rate of `0` means **unlimited**: every reservation
//! returns a zero delay.
use std::{sync::Mutex, time::Duration};

use tokio::time::Instant;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// A token bucket that hands out delays instead of blocking.
///
/// `burst` is the bucket depth: the largest number of tokens that can be
/// consumed instantly after an idle period. The bucket starts full. With a
/// burst of `0` and a non-zero rate, every reservation of `n` tokens costs
/// roughly `n / rate` seconds.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u64,
    burst: u64,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// May go negative: outstanding reservations are carried as debt.
    tokens: i128,
    updated: Instant,
}

impl RateLimiter {
    /// Creates a limiter refilling at `rate` bytes/s with the given bucket
    /// depth. A `rate` of `0` disables pacing entirely.
    pub fn new(rate: u64, burst: u64) -> Self {
        Self {
            rate,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst as i128,
                updated: Instant::now(),
            }),
        }
    }

    /// Configured refill rate in bytes/s; `0` means unlimited.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Bucket depth in tokens.
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Debits `n` tokens as of `now` and returns how long the caller must
    /// wait before the reservation is covered.
    pub fn reserve(&self, now: Instant, n: u64) -> Duration {
        if self.rate == 0 || n == 0 {
            return Duration::ZERO;
        }
        let rate = self.rate as u128;

        let mut bucket = self.bucket.lock().expect("poisoned lock");
        if now > bucket.updated {
            let accrued = now.duration_since(bucket.updated).as_nanos() * rate / NANOS_PER_SEC;
            // Sub-token durations would truncate to nothing; keep the old
            // timestamp until at least one whole token has accrued.
            if accrued > 0 {
                bucket.tokens = (bucket.tokens + accrued as i128).min(self.burst as i128);
                bucket.updated = now;
            }
        }

        bucket.tokens -= n as i128;
        if bucket.tokens >= 0 {
            Duration::ZERO
        } else {
            let owed = (-bucket.tokens) as u128;
            Duration::from_nanos((owed * NANOS_PER_SEC).div_ceil(rate) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[tokio::test(start_paused = true)]
    async fn unlimited_rate_never_delays() {
        let limiter = RateLimiter::new(0, 0);
        assert_eq!(limiter.reserve(Instant::now(), u64::MAX), Duration::ZERO);
        assert_eq!(limiter.reserve(Instant::now(), 1), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_token_reservation_is_free() {
        let limiter = RateLimiter::new(100, 0);
        assert_eq!(limiter.reserve(Instant::now(), 0), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_starts_full() {
        let limiter = RateLimiter::new(1000, 100);
        assert_eq!(limiter.reserve(Instant::now(), 100), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_burst_costs_full_duration() {
        let limiter = RateLimiter::new(1000, 0);
        let delay = limiter.reserve(Instant::now(), 500);
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn debt_accumulates_across_reservations() {
        let limiter = RateLimiter::new(1000, 0);
        let now = Instant::now();
        assert_eq!(limiter.reserve(now, 1000), Duration::from_secs(1));
        assert_eq!(limiter.reserve(now, 1000), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_capped_at_burst() {
        let limiter = RateLimiter::new(100, 50);
        // Drain the bucket, then idle far longer than one refill period.
        assert_eq!(limiter.reserve(Instant::now(), 50), Duration::ZERO);
        time::sleep(Duration::from_secs(60)).await;
        // Only one bucket's worth is available despite the long idle.
        assert_eq!(limiter.reserve(Instant::now(), 50), Duration::ZERO);
        let delay = limiter.reserve(Instant::now(), 50);
        assert_eq!(delay, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_covers_debt_over_time() {
        let limiter = RateLimiter::new(1000, 0);
        assert_eq!(limiter.reserve(Instant::now(), 1000), Duration::from_secs(1));
        time::sleep(Duration::from_secs(1)).await;
        // The earlier debt has been paid off; new debt costs its own delay.
        assert_eq!(limiter.reserve(Instant::now(), 500), Duration::from_millis(500));
    }
}
