//! # Worker registry: authoritative worker table.
//!
//! The registry is owned by the control loop (single writer), so it is a plain
//! map with no locking. It knows nothing about events; the control loop
//! publishes them after each successful transition.
//!
//! ## Rules
//! - Entries are keyed by [`WorkerId`] and iterate in id order.
//! - Every state change goes through [`Registry::transition`], which rejects
//!   moves outside the state machine.
//! - `online_count` is derived on demand, never cached.
//! - An entry is removed only after its `exit` event was dispatched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::{WorkerId, WorkerInfo, WorkerState};
use crate::error::ClusterError;
use crate::ipc::MasterFrame;
use crate::settings::Settings;

/// Registry-owned record of one worker.
pub(crate) struct Entry {
    pub(crate) info: WorkerInfo,
    /// Snapshot the worker was forked with.
    pub(crate) settings: Arc<Settings>,
    /// Frames for the worker's actor; `None` once the channel is released.
    pub(crate) outbox: Option<mpsc::UnboundedSender<MasterFrame>>,
    /// Cancelling this makes the actor kill the process.
    pub(crate) kill: CancellationToken,
    /// Exit was asked for (disconnect/destroy); it will not count as a crash.
    pub(crate) requested: bool,
    /// Killed after a grace period ran out.
    pub(crate) forced: bool,
    /// The `disconnect` event has been emitted.
    pub(crate) released: bool,
    /// Socket path, removed once the worker connects or dies.
    pub(crate) socket: Option<PathBuf>,
}

impl Entry {
    pub(crate) fn new(
        info: WorkerInfo,
        settings: Arc<Settings>,
        outbox: Option<mpsc::UnboundedSender<MasterFrame>>,
        socket: Option<PathBuf>,
    ) -> Self {
        Self {
            info,
            settings,
            outbox,
            kill: CancellationToken::new(),
            requested: false,
            forced: false,
            released: false,
            socket,
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        self.info.state
    }

    /// Drops the socket file if it is still there.
    pub(crate) fn unlink_socket(&mut self) {
        if let Some(path) = self.socket.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(worker = %self.info.id, error = %e, "socket cleanup failed");
                }
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: BTreeMap<WorkerId, Entry>,
}

impl Registry {
    pub(crate) fn insert(&mut self, entry: Entry) {
        self.entries.insert(entry.info.id, entry);
    }

    pub(crate) fn get(&self, id: WorkerId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: WorkerId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: WorkerId) -> Option<Entry> {
        self.entries.remove(&id)
    }

    /// Applies `next` if the state machine allows it and returns the new snapshot.
    ///
    /// # Errors
    /// `UnknownWorker` if the id is not registered, `InvalidState` otherwise.
    pub(crate) fn transition(
        &mut self,
        id: WorkerId,
        next: WorkerState,
    ) -> Result<WorkerInfo, ClusterError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(ClusterError::UnknownWorker { id })?;
        let current = entry.info.state;
        if !current.can_transition_to(next) {
            return Err(ClusterError::InvalidState {
                id,
                state: current,
                op: transition_op(next),
            });
        }
        entry.info.state = next;
        Ok(entry.info.clone())
    }

    /// Workers in `online` or `listening`.
    pub(crate) fn online_count(&self) -> usize {
        self.entries.values().filter(|e| e.state().is_online()).count()
    }

    /// Workers counted toward the auto-fork target.
    pub(crate) fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.state().is_live()).count()
    }

    pub(crate) fn ids(&self) -> Vec<WorkerId> {
        self.entries.keys().copied().collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<WorkerInfo> {
        self.entries.values().map(|e| e.info.clone()).collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn transition_op(next: WorkerState) -> &'static str {
    match next {
        WorkerState::Forking => "fork",
        WorkerState::Online => "mark online",
        WorkerState::Listening => "mark listening",
        WorkerState::Disconnecting => "disconnect",
        WorkerState::Dead => "reap",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u64) -> Entry {
        Entry::new(
            WorkerInfo {
                id: WorkerId::new(id),
                pid: Some(100 + id as u32),
                state: WorkerState::Forking,
            },
            Arc::new(Settings::default()),
            None,
            None,
        )
    }

    #[test]
    fn counts_follow_transitions() {
        let mut reg = Registry::default();
        reg.insert(entry(1));
        reg.insert(entry(2));
        assert_eq!(reg.online_count(), 0);
        assert_eq!(reg.live_count(), 2);

        reg.transition(WorkerId::new(1), WorkerState::Online).unwrap();
        reg.transition(WorkerId::new(2), WorkerState::Online).unwrap();
        reg.transition(WorkerId::new(2), WorkerState::Listening).unwrap();
        assert_eq!(reg.online_count(), 2);

        reg.transition(WorkerId::new(2), WorkerState::Disconnecting).unwrap();
        assert_eq!(reg.online_count(), 1);
        assert_eq!(reg.live_count(), 1);

        let info = reg.transition(WorkerId::new(2), WorkerState::Dead).unwrap();
        assert_eq!(info.state, WorkerState::Dead);
        assert_eq!(reg.online_count(), 1);
    }

    #[test]
    fn rejects_moves_outside_the_machine() {
        let mut reg = Registry::default();
        reg.insert(entry(1));
        reg.transition(WorkerId::new(1), WorkerState::Online).unwrap();

        let err = reg
            .transition(WorkerId::new(1), WorkerState::Online)
            .unwrap_err();
        assert_eq!(
            err,
            ClusterError::InvalidState {
                id: WorkerId::new(1),
                state: WorkerState::Online,
                op: "mark online"
            }
        );
        assert_eq!(reg.get(WorkerId::new(1)).unwrap().state(), WorkerState::Online);
    }

    #[test]
    fn unknown_worker() {
        let mut reg = Registry::default();
        assert_eq!(
            reg.transition(WorkerId::new(9), WorkerState::Dead).unwrap_err(),
            ClusterError::UnknownWorker { id: WorkerId::new(9) }
        );
    }

    #[test]
    fn snapshot_is_in_id_order() {
        let mut reg = Registry::default();
        reg.insert(entry(3));
        reg.insert(entry(1));
        reg.insert(entry(2));
        let ids: Vec<u64> = reg.snapshot().iter().map(|w| w.id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(reg.ids().len(), 3);
        reg.remove(WorkerId::new(1));
        reg.remove(WorkerId::new(2));
        reg.remove(WorkerId::new(3));
        assert!(reg.is_empty());
    }
}
