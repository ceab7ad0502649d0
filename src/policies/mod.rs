//! Fork-mode and replacement policies.
//!
//! This module groups the knobs that control **whether** a dead worker is
//! replaced and **how long** the master waits before forking its replacement.
//!
//! ## Contents
//! - [`ForkMode`] manual forking vs automatic crash replacement
//! - [`BackoffPolicy`] how replacement delays grow with consecutive failures
//! - [`Jitter`] randomization applied on top of the delay
//!
//! ## Quick wiring
//! ```text
//! Settings { fork_mode: ForkMode, .. }
//!      └─► core::control decides on every crash/spawn error:
//!           - fork_mode == Auto && failures <= max_consecutive_failures
//!           - delay = cfg.backoff.delay_for(failures) before fork()
//! ```

mod backoff;
mod fork_mode;

pub use backoff::{BackoffPolicy, Jitter};
pub use fork_mode::ForkMode;
