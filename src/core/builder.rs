use std::sync::atomic::AtomicU64;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::ClusterConfig;
use crate::core::cluster::{Cluster, Inner};
use crate::core::control::{ControlLoop, Outputs};
use crate::events::{Bus, EventKind, Listener, ListenerId, ListenerTable};
use crate::settings::Settings;

/// Builder for a [`Cluster`] with listeners in place before the first event.
pub struct ClusterBuilder {
    cfg: ClusterConfig,
    listeners: Vec<(Option<EventKind>, Box<dyn Listener>)>,
}

impl ClusterBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: ClusterConfig) -> Self {
        Self {
            cfg,
            listeners: Vec::new(),
        }
    }

    /// Adds a listener for events of `kind`.
    pub fn with_listener<L: Listener>(mut self, kind: EventKind, listener: L) -> Self {
        self.listeners.push((Some(kind), Box::new(listener)));
        self
    }

    /// Adds a listener for every event (e.g. `LogWriter`).
    pub fn with_any_listener<L: Listener>(mut self, listener: L) -> Self {
        self.listeners.push((None, Box::new(listener)));
        self
    }

    /// Spawns the control loop and returns the handle.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn build(self) -> Cluster {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let (settings_tx, settings_rx) = watch::channel(Settings::default());
        let (online_tx, online_rx) = watch::channel(0usize);
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let mut table = ListenerTable::default();
        let mut next = 0u64;
        for (kind, listener) in self.listeners {
            table.add(ListenerId(next), kind, false, listener);
            next += 1;
        }

        let control = ControlLoop::new(
            self.cfg,
            rx,
            tx.clone(),
            shutdown.clone(),
            Outputs {
                settings: settings_tx,
                online: online_tx,
                bus: bus.clone(),
            },
            table,
        );
        tokio::spawn(control.run());

        Cluster::from_inner(Inner {
            tx,
            settings: settings_rx,
            online: online_rx,
            bus,
            next_listener: AtomicU64::new(next),
            _guard: shutdown.drop_guard(),
        })
    }
}
