//! # Fork mode.
//!
//! [`ForkMode`] decides what happens to a worker that dies without being asked to.
//!
//! ```text
//! ForkMode::Manual → crashed worker stays dead until someone calls fork()
//! ForkMode::Auto   → crashed worker is replaced, keeping the auto_fork target
//! ```
//!
//! `auto_fork()` switches the snapshot to `Auto` even when the caller never set it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Policy controlling crash replacement.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkMode {
    /// Dead workers are left dead (default).
    #[default]
    Manual,
    /// Workers that crash or fail to spawn are re-forked.
    Auto,
}

impl ForkMode {
    /// Returns `true` for [`ForkMode::Auto`].
    #[inline]
    pub fn replaces_crashed(self) -> bool {
        matches!(self, ForkMode::Auto)
    }
}

impl fmt::Display for ForkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ForkMode::Manual => "manual",
            ForkMode::Auto => "auto",
        })
    }
}
