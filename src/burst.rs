//! The shared burst-window knob.
//!
//! A [`BurstFactor`] expresses how much time of full-line-rate traffic a
//! policed stream may emit in one burst, in seconds. With a rate of
//! 10 000 B/s and a factor of 0.005 (5 ms), the bucket depth — and therefore
//! the admission chunk — is `10000 * 0.005 = 50` bytes.
//!
//! One instance is shared by the global shaper and every wrapped connection,
//! so tightening or loosening it retunes the whole server at once. Lower
//! factors give more accurate pacing at the cost of more wakeups; the
//! default of 0.005 rarely needs adjustment outside of very low or very high
//! rates.
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// Default burst window in seconds.
pub const DEFAULT_BURST_FACTOR: f64 = 0.005;

const MIN_BURST_FACTOR: f64 = 0.001;
const MAX_BURST_FACTOR: f64 = 1.0;

/// Error returned when a burst factor lies outside the inclusive
/// `0.001..=1.0` range.
#[derive(Debug, Clone, Copy, Error)]
#[error("burst factor out of range; must be between 0.001 and 1.0")]
pub struct BurstFactorError;

/// A shareable burst-window knob you can update at runtime.
///
/// The value is an `f64` stored as raw bits in an `AtomicU64`, so readers
/// always observe a complete write without taking a lock. Stores use
/// `Release` and loads use `Acquire` ordering.
#[derive(Debug)]
pub struct BurstFactor {
    bits: AtomicU64,
}

impl Default for BurstFactor {
    fn default() -> Self {
        Self {
            bits: AtomicU64::new(DEFAULT_BURST_FACTOR.to_bits()),
        }
    }
}

impl BurstFactor {
    /// Updates the factor. Rejects values outside `0.001..=1.0` (NaN
    /// included) without changing the stored value.
    pub fn set(&self, factor: f64) -> Result<(), BurstFactorError> {
        if !(MIN_BURST_FACTOR..=MAX_BURST_FACTOR).contains(&factor) {
            return Err(BurstFactorError);
        }
        self.bits.store(factor.to_bits(), Ordering::Release);
        Ok(())
    }

    /// Returns the current factor.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// Bucket depth in bytes for `rate` bytes/s under `factor` seconds of burst.
pub(crate) fn burst_bytes(rate: u64, factor: f64) -> u64 {
    (rate as f64 * factor).ceil() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_five_milliseconds() {
        let f = BurstFactor::default();
        assert_eq!(f.get(), 0.005);
    }

    #[test]
    fn accepts_full_range() {
        let f = BurstFactor::default();
        f.set(0.001).unwrap();
        assert_eq!(f.get(), 0.001);
        f.set(1.0).unwrap();
        assert_eq!(f.get(), 1.0);
    }

    #[test]
    fn rejects_out_of_range_without_mutating() {
        let f = BurstFactor::default();
        assert!(f.set(0.0009).is_err());
        assert!(f.set(1.0001).is_err());
        assert!(f.set(-1.0).is_err());
        assert!(f.set(f64::NAN).is_err());
        assert_eq!(f.get(), DEFAULT_BURST_FACTOR);
    }

    #[test]
    fn burst_bytes_rounds_up() {
        assert_eq!(burst_bytes(10_000, 0.005), 50);
        assert_eq!(burst_bytes(128, 0.005), 1);
        assert_eq!(burst_bytes(0, 0.005), 0);
        assert_eq!(burst_bytes(1_048_576, 0.5), 524_288);
    }
}
