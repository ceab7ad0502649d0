//! # Cluster events dispatched by the control loop.
//!
//! The [`EventKind`] enum names the eight event types a master can listen to.
//! The [`Event`] struct carries the metadata that goes with each kind: the
//! worker snapshot, the settings snapshot, the IPC payload, exit details or an
//! error.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically in dispatch order.
//!
//! ## Example
//! ```rust
//! use forkvisor::{Event, EventKind, WorkerId, WorkerInfo, WorkerState};
//!
//! let ev = Event::new(EventKind::Online).with_worker(WorkerInfo {
//!     id: WorkerId::new(1),
//!     pid: Some(4242),
//!     state: WorkerState::Online,
//! });
//!
//! assert_eq!(ev.kind, EventKind::Online);
//! assert_eq!(ev.worker_id(), Some(WorkerId::new(1)));
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use serde_json::Value;

use crate::core::{ExitKind, ExitStatus, WorkerId, WorkerInfo};
use crate::error::ClusterError;
use crate::settings::Settings;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Event names a listener can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Settings replaced by `setup_master`.
    ///
    /// Sets: `settings`
    Setup,

    /// Worker created (state `forking`).
    ///
    /// Sets: `worker`
    Fork,

    /// Worker reported readiness. Fires once per worker.
    ///
    /// Sets: `worker`
    Online,

    /// Worker reported it accepts work.
    ///
    /// Sets: `worker`
    Listening,

    /// Worker reached `dead`.
    ///
    /// Sets: `worker`, `exit`, `status` (absent for spawn errors)
    Exit,

    /// Payload received from a worker.
    ///
    /// Sets: `worker` (sender), `payload`
    Message,

    /// A disconnecting worker released its channel.
    ///
    /// Sets: `worker`
    Disconnect,

    /// Something went wrong; see `error` and `fatal`.
    ///
    /// Sets: `error`, `worker` (when tied to one)
    Error,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 8] = [
        EventKind::Setup,
        EventKind::Fork,
        EventKind::Online,
        EventKind::Listening,
        EventKind::Exit,
        EventKind::Message,
        EventKind::Disconnect,
        EventKind::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Setup => "setup",
            EventKind::Fork => "fork",
            EventKind::Online => "online",
            EventKind::Listening => "listening",
            EventKind::Exit => "exit",
            EventKind::Message => "message",
            EventKind::Disconnect => "disconnect",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Worker snapshot taken at dispatch time.
    pub worker: Option<WorkerInfo>,
    /// Full settings snapshot (`setup`).
    pub settings: Option<Arc<Settings>>,
    /// IPC payload (`message`).
    pub payload: Option<Arc<Value>>,
    /// Why the worker died (`exit`).
    pub exit: Option<ExitKind>,
    /// OS exit status (`exit`).
    pub status: Option<ExitStatus>,
    /// Error details (`error`).
    pub error: Option<ClusterError>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            worker: None,
            settings: None,
            payload: None,
            exit: None,
            status: None,
            error: None,
        }
    }

    #[inline]
    pub fn with_worker(mut self, worker: WorkerInfo) -> Self {
        self.worker = Some(worker);
        self
    }

    #[inline]
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Some(Arc::new(settings));
        self
    }

    #[inline]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    #[inline]
    pub fn with_exit(mut self, kind: ExitKind, status: Option<ExitStatus>) -> Self {
        self.exit = Some(kind);
        self.status = status;
        self
    }

    #[inline]
    pub fn with_error(mut self, error: ClusterError) -> Self {
        self.error = Some(error);
        self
    }

    /// Id of the worker this event is about (the sender, for `message`).
    #[inline]
    pub fn worker_id(&self) -> Option<WorkerId> {
        self.worker.as_ref().map(|w| w.id)
    }

    /// `true` for `error` events whose error stops part of the cluster.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.error.as_ref().is_some_and(ClusterError::is_fatal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::WorkerState;

    #[test]
    fn sequence_is_monotonic() {
        let a = Event::new(EventKind::Fork);
        let b = Event::new(EventKind::Fork);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn message_carries_sender_and_payload() {
        let ev = Event::new(EventKind::Message)
            .with_worker(WorkerInfo {
                id: WorkerId::new(7),
                pid: Some(1),
                state: WorkerState::Listening,
            })
            .with_payload(serde_json::json!({"a": [1, 2]}));
        assert_eq!(ev.worker_id(), Some(WorkerId::new(7)));
        assert_eq!(ev.payload.as_deref(), Some(&serde_json::json!({"a": [1, 2]})));
    }

    #[test]
    fn fatal_only_for_fatal_errors() {
        let notice = Event::new(EventKind::Error).with_error(ClusterError::ForcedTermination {
            id: WorkerId::new(1),
            grace: std::time::Duration::from_secs(1),
        });
        assert!(!notice.is_fatal());
        let halt =
            Event::new(EventKind::Error).with_error(ClusterError::AutoForkHalted { failures: 6 });
        assert!(halt.is_fatal());
    }
}
