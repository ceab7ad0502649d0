//! # Worker identity and lifecycle state.
//!
//! ```text
//!             spawn ok          online frame        listening frame
//!  forking ─────────────► online ───────────► listening
//!     │                     │  │                 │  │
//!     │                     │  └─ disconnect ──┐ │  └─ disconnect ─┐
//!     │ spawn error /       │ crash            ▼ │ crash           ▼
//!     │ early exit /        │            disconnecting ◄───────────┘
//!     │ teardown kill       ▼                  │
//!     └───────────────────► dead ◄─────────────┘ exit
//! ```
//!
//! `dead` is terminal. `online` is entered at most once per worker.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Worker id: strictly increasing, never reused within one manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    /// Wraps a raw id.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Process spawned (or being spawned); no readiness frame yet.
    Forking,
    /// Worker reported readiness over its channel.
    Online,
    /// Worker reported it accepts work.
    Listening,
    /// Graceful shutdown requested; waiting for drain or exit.
    Disconnecting,
    /// Process exited (or never started). Terminal.
    Dead,
}

impl WorkerState {
    /// Whether the move `self → next` is part of the state machine.
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Forking, Online)
                | (Forking, Dead)
                | (Online, Listening)
                | (Online, Disconnecting)
                | (Online, Dead)
                | (Listening, Disconnecting)
                | (Listening, Dead)
                | (Disconnecting, Dead)
        )
    }

    /// Counted by `online_workers`.
    #[inline]
    pub fn is_online(self) -> bool {
        matches!(self, WorkerState::Online | WorkerState::Listening)
    }

    /// Counted toward the auto-fork target population.
    #[inline]
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerState::Forking | WorkerState::Online | WorkerState::Listening
        )
    }

    #[inline]
    pub fn is_dead(self) -> bool {
        matches!(self, WorkerState::Dead)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Forking => "forking",
            WorkerState::Online => "online",
            WorkerState::Listening => "listening",
            WorkerState::Disconnecting => "disconnecting",
            WorkerState::Dead => "dead",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a worker, carried by events and returned to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    /// OS process id; `None` if the spawn failed.
    pub pid: Option<u32>,
    pub state: WorkerState,
}

/// Why a worker reached `dead`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Exit after `disconnect`/`destroy`, or after the worker disconnected itself.
    Requested,
    /// Unexpected exit or channel break.
    Crash,
    /// The OS refused to create the process.
    SpawnError,
    /// Killed after exceeding a grace period.
    ForcedTermination,
}

impl ExitKind {
    /// Crash-like exits are the ones auto mode replaces.
    #[inline]
    pub fn is_failure(self) -> bool {
        matches!(self, ExitKind::Crash | ExitKind::SpawnError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitKind::Requested => "requested",
            ExitKind::Crash => "crash",
            ExitKind::SpawnError => "spawn_error",
            ExitKind::ForcedTermination => "forced_termination",
        }
    }
}

/// Exit code or terminating signal reported by the OS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_is_terminal() {
        for next in [
            WorkerState::Forking,
            WorkerState::Online,
            WorkerState::Listening,
            WorkerState::Disconnecting,
            WorkerState::Dead,
        ] {
            assert!(!WorkerState::Dead.can_transition_to(next));
        }
    }

    #[test]
    fn online_only_from_forking() {
        assert!(WorkerState::Forking.can_transition_to(WorkerState::Online));
        assert!(!WorkerState::Listening.can_transition_to(WorkerState::Online));
        assert!(!WorkerState::Disconnecting.can_transition_to(WorkerState::Online));
    }

    #[test]
    fn disconnecting_needs_readiness() {
        assert!(!WorkerState::Forking.can_transition_to(WorkerState::Disconnecting));
        assert!(WorkerState::Online.can_transition_to(WorkerState::Disconnecting));
        assert!(WorkerState::Listening.can_transition_to(WorkerState::Disconnecting));
    }

    #[test]
    fn online_count_excludes_disconnecting() {
        assert!(WorkerState::Listening.is_online());
        assert!(!WorkerState::Disconnecting.is_online());
        assert!(!WorkerState::Disconnecting.is_live());
        assert!(WorkerState::Forking.is_live());
    }

    #[test]
    fn failure_kinds() {
        assert!(ExitKind::Crash.is_failure());
        assert!(ExitKind::SpawnError.is_failure());
        assert!(!ExitKind::Requested.is_failure());
        assert!(!ExitKind::ForcedTermination.is_failure());
    }
}
