//! # Replacement backoff.
//!
//! [`BackoffPolicy`] spaces out auto-fork replacements so that a worker which
//! crashes on startup does not turn into a tight fork loop.
//!
//! The delay before the replacement for the `n`-th consecutive failure
//! (1-based) is `first × factor^(n-1)`, clamped to `max`, then [`Jitter`] is
//! applied. The base is derived from `n` alone, so jitter never feeds back
//! into later delays.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use forkvisor::{BackoffPolicy, Jitter};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(50),
//!     max: Duration::from_secs(2),
//!     factor: 2.0,
//!     jitter: Jitter::None,
//! };
//!
//! assert_eq!(backoff.delay_for(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay_for(3), Duration::from_millis(200));
//! assert_eq!(backoff.delay_for(20), Duration::from_secs(2));
//! ```

use std::time::Duration;

use rand::Rng;

/// Randomization applied to a computed delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Jitter {
    /// Exact delay.
    #[default]
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay/2 + uniform[0, delay/2]`.
    Equal,
}

impl Jitter {
    /// Applies this jitter to `delay`.
    pub fn apply(self, delay: Duration) -> Duration {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if ms == 0 {
            return delay;
        }
        let mut rng = rand::rng();
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(rng.random_range(0..=ms)),
            Jitter::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=ms - half))
            }
        }
    }
}

/// Delay schedule for crash replacement.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first replacement.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor per consecutive failure (`1.0` = constant).
    pub factor: f64,
    /// Randomization on top of the computed delay.
    pub jitter: Jitter,
}

impl Default for BackoffPolicy {
    /// `first = 100ms`, `factor = 2.0`, `max = 10s`, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: Jitter::None,
        }
    }
}

impl BackoffPolicy {
    /// Constant zero delay: replacements are forked immediately.
    pub fn immediate() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
            jitter: Jitter::None,
        }
    }

    /// Delay before replacing the worker lost to the `failure`-th consecutive failure.
    ///
    /// `failure` is 1-based; `0` is treated as `1`.
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exp = i32::try_from(failure.saturating_sub(1)).unwrap_or(i32::MAX);
        let nanos = self.first.as_nanos() as f64 * self.factor.powi(exp);

        let base = if !nanos.is_finite() || nanos < 0.0 || nanos >= self.max.as_nanos() as f64 {
            self.max
        } else {
            Duration::from_nanos(nanos.round() as u64)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doubling(jitter: Jitter) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn first_failure_uses_first_delay() {
        let policy = doubling(Jitter::None);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    }

    #[test]
    fn grows_then_clamps() {
        let policy = doubling(Jitter::None);
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn first_above_max_is_clamped() {
        let policy = BackoffPolicy {
            first: Duration::from_secs(30),
            ..doubling(Jitter::None)
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
    }

    #[test]
    fn immediate_is_zero() {
        let policy = BackoffPolicy::immediate();
        for n in 0..20 {
            assert_eq!(policy.delay_for(n), Duration::ZERO);
        }
    }

    #[test]
    fn full_jitter_stays_below_base() {
        let policy = doubling(Jitter::Full);
        for n in 1..12 {
            let base = doubling(Jitter::None).delay_for(n);
            assert!(policy.delay_for(n) <= base);
        }
    }

    #[test]
    fn equal_jitter_keeps_half() {
        let policy = doubling(Jitter::Equal);
        for n in 1..12 {
            let base = doubling(Jitter::None).delay_for(n);
            let delay = policy.delay_for(n);
            assert!(delay >= base / 2, "failure {n}: {delay:?} < {:?}", base / 2);
            assert!(delay <= base, "failure {n}: {delay:?} > {base:?}");
        }
    }
}
