//! Error types used by the forkvisor master and worker runtimes.
//!
//! This module defines two main error enums:
//!
//! - [`ClusterError`] : errors raised by the master-side cluster manager.
//! - [`WorkerError`] : errors raised by the worker-side IPC runtime.
//!
//! Both types provide helper methods (`as_label`, `as_message`) for logging/metrics.
//! Worker crashes are **not** errors: they are lifecycle outcomes reported through
//! the `exit` event with [`ExitKind::Crash`](crate::ExitKind::Crash).

use std::time::Duration;
use thiserror::Error;

use crate::core::{WorkerId, WorkerState};

/// # Errors produced by the cluster manager.
///
/// Some variants are returned from operations (`Validation`, `UnknownWorker`, ...),
/// others only travel inside `error` events (`ForcedTermination`, `AutoForkHalted`,
/// `ListenerPanicked`).
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// `setup_master` received an invalid option; settings were left untouched.
    #[error("invalid `{field}`: {reason}")]
    Validation {
        /// Name of the offending option.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The OS refused to create the worker process.
    #[error("failed to spawn worker {id}: {reason}")]
    Spawn {
        /// Id assigned to the worker that never started.
        id: WorkerId,
        /// OS error description.
        reason: String,
    },

    /// No worker with this id was ever forked by this manager.
    #[error("unknown worker {id}")]
    UnknownWorker {
        /// The requested id.
        id: WorkerId,
    },

    /// The operation is not allowed in the worker's current state.
    #[error("cannot {op} worker {id} in state {state}")]
    InvalidState {
        /// Target worker.
        id: WorkerId,
        /// State at the time of the request.
        state: WorkerState,
        /// Rejected operation.
        op: &'static str,
    },

    /// `destroy()` is in progress; no new workers are accepted.
    #[error("cluster is being destroyed")]
    Destroying,

    /// A worker did not exit within the grace period and was killed.
    #[error("worker {id} did not exit within {grace:?}; forcing termination")]
    ForcedTermination {
        /// Killed worker.
        id: WorkerId,
        /// The grace period that was exceeded.
        grace: Duration,
    },

    /// Auto-fork stopped replacing crashed workers.
    #[error("auto-fork halted after {failures} consecutive failures")]
    AutoForkHalted {
        /// Number of consecutive failures observed.
        failures: u32,
    },

    /// A listener panicked while handling an event.
    #[error("listener for `{event}` panicked: {info}")]
    ListenerPanicked {
        /// Name of the event being dispatched.
        event: &'static str,
        /// Panic payload, if it was a string.
        info: String,
    },

    /// The IPC endpoint could not be prepared.
    #[error("ipc setup failed: {0}")]
    Io(String),

    /// The control loop is gone (manager dropped or panicked).
    #[error("cluster control loop closed")]
    Closed,
}

impl ClusterError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    ///
    /// # Example
    /// ```
    /// use forkvisor::ClusterError;
    ///
    /// let err = ClusterError::Validation { field: "workers", reason: "negative".into() };
    /// assert_eq!(err.as_label(), "cluster_validation");
    /// ```
    pub fn as_label(&self) -> &'static str {
        match self {
            ClusterError::Validation { .. } => "cluster_validation",
            ClusterError::Spawn { .. } => "cluster_spawn",
            ClusterError::UnknownWorker { .. } => "cluster_unknown_worker",
            ClusterError::InvalidState { .. } => "cluster_invalid_state",
            ClusterError::Destroying => "cluster_destroying",
            ClusterError::ForcedTermination { .. } => "cluster_forced_termination",
            ClusterError::AutoForkHalted { .. } => "cluster_auto_fork_halted",
            ClusterError::ListenerPanicked { .. } => "cluster_listener_panicked",
            ClusterError::Io(_) => "cluster_io",
            ClusterError::Closed => "cluster_closed",
        }
    }

    /// Returns a human-readable message with details about the error.
    pub fn as_message(&self) -> String {
        self.to_string()
    }

    /// Whether the error stops part of the cluster from working.
    ///
    /// Forced terminations and listener panics are notices; a halted auto-fork is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClusterError::AutoForkHalted { .. } | ClusterError::Closed)
    }

    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        ClusterError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

/// # Errors produced by the worker-side runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The process was not started by a forkvisor master.
    #[error("not a forkvisor worker: {var} is not set")]
    NotAWorker {
        /// Missing environment variable.
        var: &'static str,
    },

    /// An environment variable was present but unusable.
    #[error("invalid {var}: {reason}")]
    InvalidEnv {
        /// Offending environment variable.
        var: &'static str,
        /// Parse failure.
        reason: String,
    },

    /// Socket I/O failed.
    #[error("ipc i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error("ipc codec: {0}")]
    Codec(String),

    /// The master closed the channel.
    #[error("channel closed by master")]
    Closed,
}

impl WorkerError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            WorkerError::NotAWorker { .. } => "worker_not_a_worker",
            WorkerError::InvalidEnv { .. } => "worker_invalid_env",
            WorkerError::Io(_) => "worker_io",
            WorkerError::Codec(_) => "worker_codec",
            WorkerError::Closed => "worker_closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(ClusterError::Destroying.as_label(), "cluster_destroying");
        assert_eq!(
            ClusterError::UnknownWorker { id: WorkerId::new(4) }.as_label(),
            "cluster_unknown_worker"
        );
        assert_eq!(WorkerError::Closed.as_label(), "worker_closed");
    }

    #[test]
    fn only_halt_is_fatal() {
        assert!(ClusterError::AutoForkHalted { failures: 3 }.is_fatal());
        assert!(
            !ClusterError::ForcedTermination {
                id: WorkerId::new(1),
                grace: Duration::from_secs(1)
            }
            .is_fatal()
        );
    }

    #[test]
    fn invalid_state_message_names_operation() {
        let err = ClusterError::InvalidState {
            id: WorkerId::new(2),
            state: WorkerState::Forking,
            op: "disconnect",
        };
        assert_eq!(err.to_string(), "cannot disconnect worker 2 in state forking");
    }
}
