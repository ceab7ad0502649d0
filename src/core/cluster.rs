//! # Cluster: master-side handle of the process cluster manager.
//!
//! [`Cluster`] is a cheap, cloneable front to the control loop. Every method
//! turns into one command; the loop answers once the command is applied.
//! [`Worker`] is the per-worker handle returned by `fork`/`auto_fork`.
//!
//! ## Example
//! ```rust,no_run
//! use forkvisor::{Cluster, ClusterConfig, EventKind, SetupOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), forkvisor::ClusterError> {
//!     let cluster = Cluster::new(ClusterConfig::default());
//!     cluster.on(EventKind::Online, |ev: &forkvisor::Event| {
//!         println!("worker {:?} is online", ev.worker_id());
//!     });
//!
//!     cluster
//!         .setup_master(SetupOptions::new().exec("/usr/local/bin/my-worker").workers(4))
//!         .await?;
//!     let workers = cluster.auto_fork(None).await?;
//!     workers[0].send("hello").await?;
//!
//!     cluster.destroy_on_signal().await
//! }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::DropGuard;

use crate::core::builder::ClusterBuilder;
use crate::core::control::Command;
use crate::core::{ClusterConfig, WorkerId, WorkerInfo, WorkerState, shutdown};
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind, Listener, ListenerId};
use crate::settings::{Settings, SetupOptions};

pub(crate) struct Inner {
    pub(crate) tx: mpsc::UnboundedSender<Command>,
    pub(crate) settings: watch::Receiver<Settings>,
    pub(crate) online: watch::Receiver<usize>,
    pub(crate) bus: Bus,
    pub(crate) next_listener: AtomicU64,
    /// Stops the control loop (and kills every worker) when the last handle goes.
    pub(crate) _guard: DropGuard,
}

/// Handle to a process cluster manager.
///
/// Clones share the same manager. Dropping the last clone stops the control
/// loop and kills every remaining worker.
///
/// ### Rules
/// - Must be created inside a tokio runtime.
/// - Listener registration (`on`/`once`/`off`) is fire-and-forget but ordered
///   with every later call made through the same manager.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

impl Cluster {
    /// Starts a manager with default settings and no listeners.
    ///
    /// # Panics
    /// When called outside a tokio runtime.
    pub fn new(cfg: ClusterConfig) -> Self {
        ClusterBuilder::new(cfg).build()
    }

    /// Returns a builder for a manager with listeners attached before it starts.
    pub fn builder(cfg: ClusterConfig) -> ClusterBuilder {
        ClusterBuilder::new(cfg)
    }

    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClusterError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .tx
            .send(make(reply))
            .map_err(|_| ClusterError::Closed)?;
        rx.await.map_err(|_| ClusterError::Closed)
    }

    // ---- configuration ----

    /// Replaces the settings snapshot and emits `setup`.
    ///
    /// Omitted options keep their previous value. No worker is forked.
    ///
    /// # Errors
    /// [`ClusterError::Validation`] (settings untouched, nothing emitted) or
    /// [`ClusterError::Closed`].
    pub async fn setup_master(&self, opts: SetupOptions) -> Result<Settings, ClusterError> {
        opts.validate()?;
        self.request(|reply| Command::Setup { opts, reply }).await
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Settings {
        self.inner.settings.borrow().clone()
    }

    /// Receiver that observes every settings replacement.
    pub fn watch_settings(&self) -> watch::Receiver<Settings> {
        self.inner.settings.clone()
    }

    /// Number of workers in `online` or `listening`.
    pub fn online_workers(&self) -> usize {
        *self.inner.online.borrow()
    }

    /// Receiver that observes every change of [`online_workers`](Self::online_workers).
    pub fn watch_online_workers(&self) -> watch::Receiver<usize> {
        self.inner.online.clone()
    }

    // ---- fork scheduler ----

    /// Forks one worker from the current settings.
    ///
    /// Returns as soon as the worker is registered in state `forking`. A worker
    /// the OS refuses to start is still returned; its `exit` event (kind
    /// `spawn_error`) has already been dispatched by then.
    ///
    /// # Errors
    /// [`ClusterError::Destroying`], [`ClusterError::Io`] or [`ClusterError::Closed`].
    pub async fn fork(&self) -> Result<Worker, ClusterError> {
        let info = self.request(|reply| Command::Fork { reply }).await??;
        Ok(Worker::new(info, self.clone()))
    }

    /// Switches to auto mode and forks until `target` (or `settings.workers`)
    /// workers are live. Returns the workers forked by this call.
    pub async fn auto_fork(&self, target: Option<usize>) -> Result<Vec<Worker>, ClusterError> {
        let infos = self
            .request(|reply| Command::AutoFork { target, reply })
            .await??;
        Ok(infos
            .into_iter()
            .map(|info| Worker::new(info, self.clone()))
            .collect())
    }

    // ---- registry ----

    /// Snapshots of every registered worker, in id order.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, ClusterError> {
        self.request(|reply| Command::Workers { reply }).await
    }

    /// Handle of a registered worker; `None` once it is dead or if it never existed.
    pub async fn worker(&self, id: WorkerId) -> Result<Option<Worker>, ClusterError> {
        let info = self.request(|reply| Command::Worker { id, reply }).await?;
        Ok(info.map(|info| Worker::new(info, self.clone())))
    }

    /// Current state of `id`; reaped workers report `dead`.
    ///
    /// # Errors
    /// [`ClusterError::UnknownWorker`] for ids this manager never handed out.
    pub async fn state(&self, id: WorkerId) -> Result<WorkerState, ClusterError> {
        self.request(|reply| Command::State { id, reply }).await?
    }

    // ---- ipc ----

    /// Sends `payload` to one worker. Queued while the worker is `forking`.
    ///
    /// # Errors
    /// [`ClusterError::UnknownWorker`], or [`ClusterError::InvalidState`] when
    /// the worker has released its channel or is dead.
    pub async fn message(&self, id: WorkerId, payload: impl Into<Value>) -> Result<(), ClusterError> {
        let payload = payload.into();
        self.request(|reply| Command::Send { id, payload, reply })
            .await?
    }

    // ---- event bus ----

    fn listen(&self, kind: Option<EventKind>, once: bool, listener: Box<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        let _ = self.inner.tx.send(Command::Listen {
            id,
            kind,
            once,
            listener,
        });
        id
    }

    /// Registers `listener` for every event of `kind`.
    pub fn on<L: Listener>(&self, kind: EventKind, listener: L) -> ListenerId {
        self.listen(Some(kind), false, Box::new(listener))
    }

    /// Registers `listener` for the next event of `kind` only.
    pub fn once<L: Listener>(&self, kind: EventKind, listener: L) -> ListenerId {
        self.listen(Some(kind), true, Box::new(listener))
    }

    /// Registers `listener` for every event.
    pub fn on_any<L: Listener>(&self, listener: L) -> ListenerId {
        self.listen(None, false, Box::new(listener))
    }

    /// Removes a listener. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        let _ = self.inner.tx.send(Command::Unlisten(id));
    }

    /// Removes every listener bound to `kind` (every listener when `None`).
    /// Returns how many were removed.
    pub async fn remove_all_listeners(&self, kind: Option<EventKind>) -> Result<usize, ClusterError> {
        self.request(|reply| Command::RemoveAll { kind, reply }).await
    }

    /// Number of listeners an event of `kind` would reach.
    pub async fn listener_count(&self, kind: EventKind) -> Result<usize, ClusterError> {
        self.request(|reply| Command::ListenerCount { kind, reply })
            .await
    }

    /// Broadcast receiver of every event dispatched after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.bus.subscribe()
    }

    // ---- lifecycle ----

    /// Starts a graceful disconnect of one worker, or of every worker when `None`.
    ///
    /// Returns once the request is applied; completion is reported by the
    /// `disconnect` and `exit` events.
    ///
    /// # Errors
    /// [`ClusterError::InvalidState`] for a single worker still `forking`,
    /// [`ClusterError::UnknownWorker`] for ids never handed out.
    pub async fn disconnect(&self, id: Option<WorkerId>) -> Result<(), ClusterError> {
        self.request(|reply| Command::Disconnect { id, reply })
            .await?
    }

    /// Disconnects every worker, kills those still alive after the grace
    /// period and resets the manager. Returns once every worker is dead.
    pub async fn destroy(&self) -> Result<(), ClusterError> {
        self.request(|reply| Command::Destroy { reply }).await
    }

    /// Waits for SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere), then [`destroy`](Self::destroy)s.
    pub async fn destroy_on_signal(&self) -> Result<(), ClusterError> {
        shutdown::wait_for_shutdown_signal()
            .await
            .map_err(|e| ClusterError::Io(e.to_string()))?;
        tracing::info!("shutdown signal received");
        self.destroy().await
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("online_workers", &self.online_workers())
            .finish_non_exhaustive()
    }
}

/// Handle to one forked worker.
///
/// Carries the snapshot taken when the handle was created; ask
/// [`state`](Self::state) for the live value.
#[derive(Clone)]
pub struct Worker {
    info: WorkerInfo,
    cluster: Cluster,
}

impl Worker {
    fn new(info: WorkerInfo, cluster: Cluster) -> Self {
        Self { info, cluster }
    }

    #[inline]
    pub fn id(&self) -> WorkerId {
        self.info.id
    }

    /// OS process id; `None` if the spawn failed.
    #[inline]
    pub fn pid(&self) -> Option<u32> {
        self.info.pid
    }

    /// Snapshot taken when this handle was created.
    #[inline]
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Sends `payload` to this worker.
    pub async fn send(&self, payload: impl Into<Value>) -> Result<(), ClusterError> {
        self.cluster.message(self.info.id, payload).await
    }

    /// Starts a graceful disconnect of this worker.
    pub async fn disconnect(&self) -> Result<(), ClusterError> {
        self.cluster.disconnect(Some(self.info.id)).await
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> Result<WorkerState, ClusterError> {
        self.cluster.state(self.info.id).await
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.info.id)
            .field("pid", &self.info.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ExitKind, WorkerState};
    use std::sync::Mutex;

    #[tokio::test]
    async fn invalid_setup_emits_nothing() {
        let cluster = Cluster::new(ClusterConfig::default());
        let mut rx = cluster.subscribe();
        let before = cluster.settings();

        let err = cluster
            .setup_master(SetupOptions::new().workers(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::Validation { field: "workers", .. }));
        assert_eq!(cluster.settings(), before);

        let applied = cluster.setup_master(SetupOptions::new().workers(3)).await.unwrap();
        assert_eq!(applied.workers, 3);
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Setup);
        assert_eq!(ev.settings.as_deref(), Some(&applied));
    }

    #[tokio::test]
    async fn setup_event_reaches_listeners_before_return() {
        let cluster = Cluster::new(ClusterConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        cluster.on(EventKind::Setup, move |ev: &Event| {
            sink.lock().unwrap().push(ev.settings.as_ref().map(|s| s.silent));
        });

        cluster.setup_master(SetupOptions::new().silent(true)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![Some(true)]);
    }

    #[tokio::test]
    async fn spawn_error_goes_straight_to_dead() {
        let cluster = Cluster::new(ClusterConfig::default());
        cluster
            .setup_master(SetupOptions::new().exec("/nonexistent/forkvisor-worker"))
            .await
            .unwrap();
        let mut rx = cluster.subscribe();

        let worker = cluster.fork().await.unwrap();
        assert_eq!(worker.pid(), None);
        assert_eq!(worker.state().await.unwrap(), WorkerState::Dead);

        let kinds: Vec<EventKind> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|ev| ev.kind)
        .collect();
        assert_eq!(kinds, vec![EventKind::Fork, EventKind::Error, EventKind::Exit]);
        assert!(cluster.workers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spawn_error_exit_kind() {
        let cluster = Cluster::new(ClusterConfig::default());
        cluster
            .setup_master(SetupOptions::new().exec("/nonexistent/forkvisor-worker"))
            .await
            .unwrap();
        let exits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&exits);
        cluster.on(EventKind::Exit, move |ev: &Event| {
            sink.lock().unwrap().push(ev.exit);
        });

        cluster.fork().await.unwrap();
        assert_eq!(*exits.lock().unwrap(), vec![Some(ExitKind::SpawnError)]);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let cluster = Cluster::new(ClusterConfig::default());
        let id = WorkerId::new(42);
        assert_eq!(
            cluster.message(id, "x").await.unwrap_err(),
            ClusterError::UnknownWorker { id }
        );
        assert_eq!(
            cluster.disconnect(Some(id)).await.unwrap_err(),
            ClusterError::UnknownWorker { id }
        );
        assert!(cluster.worker(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listener_bookkeeping() {
        let cluster = Cluster::new(ClusterConfig::default());
        let a = cluster.on(EventKind::Fork, |_: &Event| {});
        cluster.once(EventKind::Fork, |_: &Event| {});
        cluster.on_any(|_: &Event| {});
        assert_eq!(cluster.listener_count(EventKind::Fork).await.unwrap(), 3);
        assert_eq!(cluster.listener_count(EventKind::Exit).await.unwrap(), 1);

        cluster.off(a);
        assert_eq!(cluster.listener_count(EventKind::Fork).await.unwrap(), 2);
        assert_eq!(cluster.remove_all_listeners(None).await.unwrap(), 2);
        assert_eq!(cluster.listener_count(EventKind::Fork).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn destroy_on_empty_cluster_resets_settings() {
        let cluster = Cluster::new(ClusterConfig::default());
        cluster
            .setup_master(SetupOptions::new().workers(7).silent(true))
            .await
            .unwrap();
        cluster.destroy().await.unwrap();
        assert_eq!(cluster.settings(), Settings::default());
        cluster.destroy().await.unwrap();
    }
}
