//! # Manager runtime configuration.
//!
//! [`ClusterConfig`] holds the knobs of the manager itself. It is fixed at
//! construction; the per-cluster [`Settings`](crate::Settings) are what
//! `setup_master` replaces.
//!
//! ## Sentinel values
//! - `disconnect_timeout = 0s` → `disconnect()` waits for the worker indefinitely
//! - `grace = 0s` → `destroy()` kills remaining workers right away

use std::time::Duration;

use crate::policies::BackoffPolicy;

/// Configuration of a [`Cluster`](crate::Cluster) manager.
///
/// ## Field semantics
/// - `grace`: how long `destroy()` waits for workers to exit before killing them
/// - `disconnect_timeout`: same bound for an individual `disconnect()` (`0s` = none)
/// - `max_consecutive_failures`: crash/spawn failures tolerated in auto mode
///   before replacement halts with a fatal `error` event
/// - `healthy_after`: uptime after `online` that clears the failure count
/// - `backoff`: delay schedule for auto-mode replacements
/// - `bus_capacity`: ring size of the broadcast tap returned by `subscribe()`
/// - `max_frame_len`: longest accepted IPC line, in bytes
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Maximum wait for workers to exit during `destroy()`.
    pub grace: Duration,

    /// Maximum wait for a single disconnecting worker (`0s` = wait forever).
    pub disconnect_timeout: Duration,

    /// Consecutive failures tolerated by auto-fork replacement.
    ///
    /// The counter grows on every crash or spawn error that leaves the
    /// population below the auto target, and resets when a worker reports
    /// `listening` or stays `online` for `healthy_after`. Once it exceeds this
    /// bound no further replacement is attempted until the manager is destroyed.
    pub max_consecutive_failures: u32,

    /// Time a worker must stay `online` before the failure count resets.
    ///
    /// Reaching `listening` resets it immediately.
    pub healthy_after: Duration,

    /// Delay schedule applied before each replacement fork.
    pub backoff: BackoffPolicy,

    /// Capacity of the broadcast channel behind `Cluster::subscribe`.
    ///
    /// Receivers lagging more than this many events observe `Lagged`.
    pub bus_capacity: usize,

    /// Maximum length of one newline-delimited IPC frame.
    pub max_frame_len: usize,
}

impl ClusterConfig {
    /// Returns the disconnect timeout as an `Option`.
    ///
    /// - `None` → wait until the worker exits on its own
    /// - `Some(d)` → kill after `d`
    #[inline]
    pub fn disconnect_deadline(&self) -> Option<Duration> {
        if self.disconnect_timeout == Duration::ZERO {
            None
        } else {
            Some(self.disconnect_timeout)
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for ClusterConfig {
    /// - `grace = 10s`
    /// - `disconnect_timeout = 0s` (wait indefinitely)
    /// - `max_consecutive_failures = 5`
    /// - `healthy_after = 5s`
    /// - `backoff = BackoffPolicy::default()`
    /// - `bus_capacity = 1024`
    /// - `max_frame_len = 8 MiB`
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            disconnect_timeout: Duration::ZERO,
            max_consecutive_failures: 5,
            healthy_after: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            bus_capacity: 1024,
            max_frame_len: 8 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_disconnect_timeout_means_none() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.disconnect_deadline(), None);

        let cfg = ClusterConfig {
            disconnect_timeout: Duration::from_millis(250),
            ..ClusterConfig::default()
        };
        assert_eq!(cfg.disconnect_deadline(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn bus_capacity_never_zero() {
        let cfg = ClusterConfig {
            bus_capacity: 0,
            ..ClusterConfig::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
