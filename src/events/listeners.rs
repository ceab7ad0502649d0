//! # Ordered listener table.
//!
//! [`ListenerTable`] is the master-local pub/sub register. It is owned by the
//! control loop, so it needs no locking.
//!
//! ## Architecture
//! ```text
//! dispatch(&Event)
//!     │
//!     ├──► entry #1 (kind matches) ──► catch_unwind(listener.on_event) ── panic → ListenerPanicked
//!     ├──► entry #2 (kind differs)     skipped
//!     └──► entry #N (kind matches) ──► catch_unwind(listener.on_event)
//!
//! once-entries that fired are removed after the pass.
//! ```
//!
//! ## Rules
//! - **Subscription order**: listeners for one event fire in the order they were added.
//! - **Isolation**: a panicking listener is reported and the pass continues.
//! - **Synchronous**: listeners run on the control loop and must not block it;
//!   forward to a channel for async work.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::ClusterError;
use crate::events::{Event, EventKind};

/// Handle returned by `on`/`once`, used with `off`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

/// Event handler invoked on the control loop.
///
/// Implemented for every `Fn(&Event) + Send + 'static` closure.
///
/// # Example
/// ```rust
/// use forkvisor::{Event, Listener};
///
/// struct Counter(std::sync::atomic::AtomicUsize);
///
/// impl Listener for Counter {
///     fn on_event(&self, _event: &Event) {
///         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
///     }
///     fn name(&self) -> &'static str { "counter" }
/// }
/// ```
pub trait Listener: Send + 'static {
    /// Handle a single event.
    fn on_event(&self, event: &Event);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<F> Listener for F
where
    F: Fn(&Event) + Send + 'static,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

struct Entry {
    id: ListenerId,
    /// `None` listens to every kind.
    kind: Option<EventKind>,
    once: bool,
    listener: Box<dyn Listener>,
}

#[derive(Default)]
pub(crate) struct ListenerTable {
    entries: Vec<Entry>,
}

impl ListenerTable {
    pub(crate) fn add(
        &mut self,
        id: ListenerId,
        kind: Option<EventKind>,
        once: bool,
        listener: Box<dyn Listener>,
    ) {
        self.entries.push(Entry {
            id,
            kind,
            once,
            listener,
        });
    }

    /// Removes one listener; `false` if it was already gone.
    pub(crate) fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Removes every listener bound to `kind` (all listeners when `None`).
    pub(crate) fn remove_all(&mut self, kind: Option<EventKind>) -> usize {
        let before = self.entries.len();
        match kind {
            Some(k) => self.entries.retain(|e| e.kind != Some(k)),
            None => self.entries.clear(),
        }
        before - self.entries.len()
    }

    /// Number of listeners that would receive an event of `kind`.
    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.entries.iter().filter(|e| e.matches(kind)).count()
    }

    /// Runs every matching listener in order and returns the panics it contained.
    pub(crate) fn dispatch(&mut self, ev: &Event) -> Vec<ClusterError> {
        let mut panics = Vec::new();
        let mut fired_once = Vec::new();

        for entry in self.entries.iter().filter(|e| e.matches(ev.kind)) {
            if entry.once {
                fired_once.push(entry.id);
            }
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| entry.listener.on_event(ev))) {
                let info = panic_message(payload.as_ref());
                tracing::error!(
                    listener = entry.listener.name(),
                    event = ev.kind.as_str(),
                    %info,
                    "listener panicked"
                );
                panics.push(ClusterError::ListenerPanicked {
                    event: ev.kind.as_str(),
                    info,
                });
            }
        }

        if !fired_once.is_empty() {
            self.entries.retain(|e| !fired_once.contains(&e.id));
        }
        panics
    }
}

impl Entry {
    fn matches(&self, kind: EventKind) -> bool {
        self.kind.is_none_or(|k| k == kind)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Box<dyn Listener> {
        let log = Arc::clone(log);
        Box::new(move |_: &Event| log.lock().unwrap().push(tag))
    }

    #[test]
    fn fires_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = ListenerTable::default();
        table.add(ListenerId(1), Some(EventKind::Fork), false, recorder(&log, "a"));
        table.add(ListenerId(2), None, false, recorder(&log, "any"));
        table.add(ListenerId(3), Some(EventKind::Fork), false, recorder(&log, "b"));
        table.add(ListenerId(4), Some(EventKind::Exit), false, recorder(&log, "exit"));

        assert!(table.dispatch(&Event::new(EventKind::Fork)).is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["a", "any", "b"]);
    }

    fn explode(_: &Event) {
        panic!("boom");
    }

    #[test]
    fn panic_does_not_stop_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = ListenerTable::default();
        table.add(
            ListenerId(1),
            Some(EventKind::Online),
            false,
            Box::new(explode),
        );
        table.add(ListenerId(2), Some(EventKind::Online), false, recorder(&log, "after"));

        let panics = table.dispatch(&Event::new(EventKind::Online));
        assert_eq!(
            panics,
            vec![ClusterError::ListenerPanicked {
                event: "online",
                info: "boom".into()
            }]
        );
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
        assert_eq!(table.count(EventKind::Online), 2);
    }

    #[test]
    fn once_fires_a_single_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = ListenerTable::default();
        table.add(ListenerId(1), Some(EventKind::Message), true, recorder(&log, "once"));

        table.dispatch(&Event::new(EventKind::Message));
        table.dispatch(&Event::new(EventKind::Message));
        assert_eq!(*log.lock().unwrap(), vec!["once"]);
        assert_eq!(table.count(EventKind::Message), 0);
    }

    #[test]
    fn remove_all_by_kind_keeps_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = ListenerTable::default();
        table.add(ListenerId(1), Some(EventKind::Exit), false, recorder(&log, "x"));
        table.add(ListenerId(2), Some(EventKind::Exit), false, recorder(&log, "y"));
        table.add(ListenerId(3), Some(EventKind::Fork), false, recorder(&log, "z"));

        assert_eq!(table.remove_all(Some(EventKind::Exit)), 2);
        assert_eq!(table.count(EventKind::Exit), 0);
        assert_eq!(table.count(EventKind::Fork), 1);
        assert!(!table.remove(ListenerId(1)));
        assert!(table.remove(ListenerId(3)));
        assert_eq!(table.remove_all(None), 0);
    }
}
