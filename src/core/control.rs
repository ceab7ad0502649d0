//! # Control loop: single owner of the cluster state.
//!
//! Every public operation of [`Cluster`](crate::Cluster) becomes a [`Command`]
//! on an unbounded channel. The loop applies commands one at a time, so the
//! registry, settings, listener table and teardown state need no locks.
//!
//! ## Architecture
//! ```text
//! Cluster handles ──┐
//! WorkerActors ─────┼──► mpsc<Command> ──► ControlLoop::handle()
//! timers ───────────┘                          │
//!                                              ├─► Registry::transition()
//!                                              ├─► watch<usize>  (online_workers)
//!                                              ├─► ListenerTable::dispatch()
//!                                              └─► Bus::publish()
//! ```
//!
//! ## Rules
//! - The `online_workers` watch is updated before the event of the transition
//!   that changed it is dispatched.
//! - Replies are sent once the command is applied; nothing waits for a worker
//!   to become ready.
//! - Timers (replacement backoff, disconnect timeout, destroy grace) are
//!   spawned tasks that post a command back; stale timers are dropped by
//!   comparing the generation they were armed in.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;

use crate::core::actor::{WorkerActor, WorkerReport, stdio};
use crate::core::registry::{Entry, Registry};
use crate::core::{ClusterConfig, ExitKind, ExitStatus, WorkerId, WorkerInfo, WorkerState};
use crate::error::ClusterError;
use crate::events::{Bus, Event, EventKind, Listener, ListenerId, ListenerTable};
use crate::ipc::{ENV_IPC_PATH, ENV_WORKER_ID, IpcDir, MasterFrame, WorkerFrame};
use crate::policies::ForkMode;
use crate::settings::{Settings, SetupOptions};

type Reply<T> = oneshot::Sender<T>;

/// How long a worker may outlive a broken channel before it is killed.
const BROKEN_CHANNEL_GRACE: Duration = Duration::from_millis(500);

/// Requests handled by the control loop.
pub(crate) enum Command {
    Setup {
        opts: SetupOptions,
        reply: Reply<Settings>,
    },
    Fork {
        reply: Reply<Result<WorkerInfo, ClusterError>>,
    },
    AutoFork {
        target: Option<usize>,
        reply: Reply<Result<Vec<WorkerInfo>, ClusterError>>,
    },
    Listen {
        id: ListenerId,
        kind: Option<EventKind>,
        once: bool,
        listener: Box<dyn Listener>,
    },
    Unlisten(ListenerId),
    RemoveAll {
        kind: Option<EventKind>,
        reply: Reply<usize>,
    },
    ListenerCount {
        kind: EventKind,
        reply: Reply<usize>,
    },
    Send {
        id: WorkerId,
        payload: Value,
        reply: Reply<Result<(), ClusterError>>,
    },
    Disconnect {
        id: Option<WorkerId>,
        reply: Reply<Result<(), ClusterError>>,
    },
    Destroy {
        reply: Reply<()>,
    },
    Workers {
        reply: Reply<Vec<WorkerInfo>>,
    },
    Worker {
        id: WorkerId,
        reply: Reply<Option<WorkerInfo>>,
    },
    State {
        id: WorkerId,
        reply: Reply<Result<WorkerState, ClusterError>>,
    },
    Report(WorkerReport),
    /// Kills a worker whose channel broke if it is still around.
    BrokenChannel(WorkerId),
    /// A worker stayed online for `healthy_after`.
    Healthy(WorkerId),
    DisconnectTimeout(WorkerId),
    GraceElapsed(u64),
    Replace(u64),
}

/// Channels the loop publishes state through.
pub(crate) struct Outputs {
    pub(crate) settings: watch::Sender<Settings>,
    pub(crate) online: watch::Sender<usize>,
    pub(crate) bus: Bus,
}

pub(crate) struct ControlLoop {
    cfg: ClusterConfig,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
    out: Outputs,

    registry: Registry,
    listeners: ListenerTable,
    ipc: Option<IpcDir>,
    /// Last id handed out; ids are never reused.
    last_id: u64,

    /// Population kept by auto mode; `None` until `auto_fork` is called.
    auto_target: Option<usize>,
    failures: u32,
    halted: bool,

    destroying: bool,
    destroy_waiters: Vec<Reply<()>>,
    /// Bumped on every reset; timers armed earlier are ignored.
    generation: u64,
}

impl ControlLoop {
    pub(crate) fn new(
        cfg: ClusterConfig,
        rx: mpsc::UnboundedReceiver<Command>,
        tx: mpsc::UnboundedSender<Command>,
        shutdown: CancellationToken,
        out: Outputs,
        listeners: ListenerTable,
    ) -> Self {
        Self {
            cfg,
            rx,
            tx,
            shutdown,
            out,
            registry: Registry::default(),
            listeners,
            ipc: None,
            last_id: 0,
            auto_target: None,
            failures: 0,
            halted: false,
            destroying: false,
            destroy_waiters: Vec::new(),
            generation: 0,
        }
    }

    /// Applies commands until every handle is dropped.
    pub(crate) async fn run(mut self) {
        loop {
            select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        for id in self.registry.ids() {
            if let Some(entry) = self.registry.get_mut(id) {
                entry.kill.cancel();
                entry.unlink_socket();
            }
        }
        tracing::debug!("control loop stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Setup { opts, reply } => {
                let _ = reply.send(self.setup(opts));
            }
            Command::Fork { reply } => {
                let _ = reply.send(self.fork());
            }
            Command::AutoFork { target, reply } => {
                let _ = reply.send(self.auto_fork(target));
            }
            Command::Listen {
                id,
                kind,
                once,
                listener,
            } => self.listeners.add(id, kind, once, listener),
            Command::Unlisten(id) => {
                self.listeners.remove(id);
            }
            Command::RemoveAll { kind, reply } => {
                let _ = reply.send(self.listeners.remove_all(kind));
            }
            Command::ListenerCount { kind, reply } => {
                let _ = reply.send(self.listeners.count(kind));
            }
            Command::Send { id, payload, reply } => {
                let _ = reply.send(self.send(id, payload));
            }
            Command::Disconnect { id, reply } => {
                let res = match id {
                    Some(id) => self.disconnect_one(id),
                    None => {
                        self.disconnect_all();
                        Ok(())
                    }
                };
                let _ = reply.send(res);
            }
            Command::Destroy { reply } => self.destroy(reply),
            Command::Workers { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
            Command::Worker { id, reply } => {
                let _ = reply.send(self.registry.get(id).map(|e| e.info.clone()));
            }
            Command::State { id, reply } => {
                let _ = reply.send(self.state_of(id));
            }
            Command::Report(report) => self.on_report(report),
            Command::BrokenChannel(id) => self.on_broken_channel(id),
            Command::Healthy(id) => self.on_healthy(id),
            Command::DisconnectTimeout(id) => self.on_disconnect_timeout(id),
            Command::GraceElapsed(generation) => self.on_grace_elapsed(generation),
            Command::Replace(generation) => self.on_replace(generation),
        }
    }

    // ---- configuration store ----

    fn setup(&mut self, opts: SetupOptions) -> Settings {
        let next = opts.apply_to(&self.out.settings.borrow());
        self.out.settings.send_replace(next.clone());
        tracing::debug!(workers = next.workers, exec = %next.exec.display(), "settings replaced");
        self.emit(Event::new(EventKind::Setup).with_settings(next.clone()));
        next
    }

    fn current_settings(&self) -> Settings {
        self.out.settings.borrow().clone()
    }

    // ---- fork scheduler ----

    fn fork(&mut self) -> Result<WorkerInfo, ClusterError> {
        if self.destroying {
            return Err(ClusterError::Destroying);
        }
        let settings = Arc::new(self.current_settings());
        settings.check_exec()?;
        if self.ipc.is_none() {
            let dir = IpcDir::new().map_err(|e| ClusterError::Io(e.to_string()))?;
            self.ipc = Some(dir);
        }
        let Some(dir) = self.ipc.as_ref() else {
            return Err(ClusterError::Io("ipc directory unavailable".into()));
        };

        self.last_id += 1;
        let id = WorkerId::new(self.last_id);
        let (listener, path) = dir.bind(id).map_err(|e| ClusterError::Io(e.to_string()))?;

        let (stdin, stdout, stderr) = stdio(settings.silent);
        let spawned = tokio::process::Command::new(&settings.exec)
            .args(&settings.args)
            .env(ENV_WORKER_ID, id.to_string())
            .env(ENV_IPC_PATH, &path)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => {
                let info = WorkerInfo {
                    id,
                    pid: child.id(),
                    state: WorkerState::Forking,
                };
                let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
                let entry = Entry::new(info.clone(), settings, Some(outbox_tx), Some(path));
                let actor = WorkerActor::new(
                    id,
                    child,
                    listener,
                    outbox_rx,
                    entry.kill.clone(),
                    self.tx.clone(),
                    self.cfg.max_frame_len,
                );
                self.registry.insert(entry);
                tokio::spawn(actor.run());

                tracing::debug!(worker = %id, pid = ?info.pid, "worker forked");
                self.emit(Event::new(EventKind::Fork).with_worker(info.clone()));
                Ok(info)
            }
            Err(e) => {
                drop(listener);
                let _ = std::fs::remove_file(&path);
                let reason = e.to_string();
                tracing::error!(worker = %id, exec = %settings.exec.display(), error = %reason, "spawn failed");

                let info = WorkerInfo {
                    id,
                    pid: None,
                    state: WorkerState::Forking,
                };
                self.registry
                    .insert(Entry::new(info.clone(), settings, None, None));
                self.emit(Event::new(EventKind::Fork).with_worker(info.clone()));
                self.emit(
                    Event::new(EventKind::Error)
                        .with_worker(info.clone())
                        .with_error(ClusterError::Spawn { id, reason }),
                );
                self.reap(id, ExitKind::SpawnError, None);
                Ok(info)
            }
        }
    }

    fn auto_fork(&mut self, target: Option<usize>) -> Result<Vec<WorkerInfo>, ClusterError> {
        if self.destroying {
            return Err(ClusterError::Destroying);
        }
        let mut settings = self.current_settings();
        let target = target.unwrap_or(settings.workers);
        if settings.fork_mode != ForkMode::Auto {
            settings.fork_mode = ForkMode::Auto;
            self.out.settings.send_replace(settings);
        }
        self.auto_target = Some(target);

        let missing = target.saturating_sub(self.registry.live_count());
        let mut forked = Vec::with_capacity(missing);
        for _ in 0..missing {
            forked.push(self.fork()?);
        }
        tracing::debug!(target, forked = forked.len(), "auto fork");
        Ok(forked)
    }

    fn replaces_crashed(&self) -> bool {
        !self.destroying && !self.halted && self.out.settings.borrow().fork_mode.replaces_crashed()
    }

    fn auto_target(&self) -> usize {
        self.auto_target
            .unwrap_or_else(|| self.out.settings.borrow().workers)
    }

    fn on_failure(&mut self) {
        if !self.replaces_crashed() {
            return;
        }
        let (live, target) = (self.registry.live_count(), self.auto_target());
        if live >= target {
            tracing::debug!(live, target, "crash above target; not replaced");
            return;
        }
        self.failures += 1;
        if self.failures > self.cfg.max_consecutive_failures {
            self.halted = true;
            tracing::error!(failures = self.failures, "auto fork halted");
            self.emit(
                Event::new(EventKind::Error).with_error(ClusterError::AutoForkHalted {
                    failures: self.failures,
                }),
            );
            return;
        }

        let delay = self.cfg.backoff.delay_for(self.failures);
        tracing::debug!(failures = self.failures, ?delay, "replacement scheduled");
        self.post_after(delay, Command::Replace(self.generation));
    }

    fn on_replace(&mut self, generation: u64) {
        if generation != self.generation || !self.replaces_crashed() {
            return;
        }
        if self.registry.live_count() >= self.auto_target() {
            return;
        }
        if let Err(e) = self.fork() {
            tracing::error!(error = %e, "replacement fork failed");
            self.emit(Event::new(EventKind::Error).with_error(e));
        }
    }

    // ---- registry transitions ----

    fn on_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Connected(id) => {
                if let Some(entry) = self.registry.get_mut(id) {
                    entry.unlink_socket();
                }
            }
            WorkerReport::Frame(id, frame) => self.on_frame(id, frame),
            WorkerReport::ChannelClosed(id) => self.on_channel_closed(id),
            WorkerReport::Exited(id, status) => {
                let Some(entry) = self.registry.get(id) else {
                    return;
                };
                let kind = if entry.forced {
                    ExitKind::ForcedTermination
                } else if entry.requested {
                    ExitKind::Requested
                } else {
                    ExitKind::Crash
                };
                self.reap(id, kind, Some(status));
            }
        }
    }

    fn on_frame(&mut self, id: WorkerId, frame: WorkerFrame) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        let requested = entry.requested;

        match frame {
            WorkerFrame::Online => {
                if requested {
                    return;
                }
                if self.advance(id, WorkerState::Online, EventKind::Online) {
                    self.post_after(self.cfg.healthy_after, Command::Healthy(id));
                }
            }
            WorkerFrame::Listening => {
                if requested {
                    return;
                }
                if self.advance(id, WorkerState::Listening, EventKind::Listening) {
                    self.reset_failures(id);
                }
            }
            WorkerFrame::Message { payload } => {
                let info = entry.info.clone();
                self.emit(
                    Event::new(EventKind::Message)
                        .with_worker(info)
                        .with_payload(payload),
                );
            }
            WorkerFrame::Disconnect => {
                if entry.state().is_online() {
                    if let Some(entry) = self.registry.get_mut(id) {
                        entry.requested = true;
                    }
                    if !self.advance(id, WorkerState::Disconnecting, EventKind::Disconnect) {
                        return;
                    }
                    tracing::debug!(worker = %id, "worker disconnected itself");
                    if let Some(entry) = self.registry.get_mut(id) {
                        entry.released = true;
                        entry.outbox = None;
                    }
                } else {
                    self.release(id);
                }
            }
        }
    }

    /// Transition + watch update + event. `false` if the move was rejected.
    fn advance(&mut self, id: WorkerId, next: WorkerState, kind: EventKind) -> bool {
        match self.registry.transition(id, next) {
            Ok(info) => {
                self.publish_online();
                self.emit(Event::new(kind).with_worker(info));
                true
            }
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "transition rejected");
                false
            }
        }
    }

    fn on_channel_closed(&mut self, id: WorkerId) {
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        match entry.state() {
            WorkerState::Disconnecting => self.release(id),
            WorkerState::Dead => {}
            _ if entry.requested => {}
            state => {
                tracing::warn!(worker = %id, %state, "ipc channel broke");
                entry.outbox = None;
                self.post_after(BROKEN_CHANNEL_GRACE, Command::BrokenChannel(id));
            }
        }
    }

    /// The process outlived its channel by [`BROKEN_CHANNEL_GRACE`].
    fn on_broken_channel(&mut self, id: WorkerId) {
        let Some(entry) = self.registry.get(id) else {
            return;
        };
        if entry.requested || entry.state().is_dead() {
            return;
        }
        tracing::warn!(worker = %id, "worker still running without a channel; killing");
        entry.kill.cancel();
    }

    fn on_healthy(&mut self, id: WorkerId) {
        let healthy = self
            .registry
            .get(id)
            .is_some_and(|entry| entry.state().is_online());
        if healthy {
            self.reset_failures(id);
        }
    }

    fn reset_failures(&mut self, id: WorkerId) {
        if self.failures > 0 {
            tracing::debug!(worker = %id, failures = self.failures, "failure count reset");
        }
        self.failures = 0;
    }

    /// Emits `disconnect` once for a disconnecting worker whose channel is gone.
    fn release(&mut self, id: WorkerId) {
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        if entry.state() != WorkerState::Disconnecting || entry.released {
            return;
        }
        entry.released = true;
        entry.outbox = None;
        let info = entry.info.clone();
        self.emit(Event::new(EventKind::Disconnect).with_worker(info));
    }

    /// Moves a worker to `dead`, emits `exit` and drops it from the registry.
    fn reap(&mut self, id: WorkerId, kind: ExitKind, status: Option<ExitStatus>) {
        self.release(id);
        let info = match self.registry.transition(id, WorkerState::Dead) {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "reap rejected");
                return;
            }
        };
        let exec = self.registry.remove(id).map(|mut entry| {
            entry.outbox = None;
            entry.unlink_socket();
            entry.settings.exec.clone()
        });
        self.publish_online();

        match kind {
            ExitKind::Crash => {
                tracing::warn!(worker = %id, exec = ?exec, ?status, "worker crashed")
            }
            _ => tracing::debug!(worker = %id, kind = kind.as_str(), ?status, "worker exited"),
        }
        self.emit(Event::new(EventKind::Exit).with_worker(info).with_exit(kind, status));

        if kind.is_failure() {
            self.on_failure();
        }
        self.maybe_finish_destroy();
    }

    fn publish_online(&self) {
        let count = self.registry.online_count();
        self.out.online.send_if_modified(|cur| {
            let changed = *cur != count;
            *cur = count;
            changed
        });
    }

    // ---- ipc ----

    fn send(&mut self, id: WorkerId, payload: Value) -> Result<(), ClusterError> {
        let state = self.state_of(id)?;
        let delivered = self
            .registry
            .get(id)
            .and_then(|e| e.outbox.as_ref())
            .is_some_and(|outbox| outbox.send(MasterFrame::Message { payload }).is_ok());
        if delivered {
            Ok(())
        } else {
            Err(ClusterError::InvalidState {
                id,
                state,
                op: "message",
            })
        }
    }

    fn state_of(&self, id: WorkerId) -> Result<WorkerState, ClusterError> {
        match self.registry.get(id) {
            Some(entry) => Ok(entry.state()),
            None if id.get() >= 1 && id.get() <= self.last_id => Ok(WorkerState::Dead),
            None => Err(ClusterError::UnknownWorker { id }),
        }
    }

    // ---- lifecycle controller ----

    fn disconnect_one(&mut self, id: WorkerId) -> Result<(), ClusterError> {
        match self.state_of(id)? {
            WorkerState::Forking => Err(ClusterError::InvalidState {
                id,
                state: WorkerState::Forking,
                op: "disconnect",
            }),
            WorkerState::Online | WorkerState::Listening => {
                self.begin_disconnect(id);
                Ok(())
            }
            WorkerState::Disconnecting | WorkerState::Dead => Ok(()),
        }
    }

    fn begin_disconnect(&mut self, id: WorkerId) {
        if let Some(entry) = self.registry.get_mut(id) {
            entry.requested = true;
        }
        if let Err(e) = self.registry.transition(id, WorkerState::Disconnecting) {
            tracing::warn!(worker = %id, error = %e, "disconnect rejected");
            return;
        }
        self.publish_online();
        if let Some(entry) = self.registry.get(id) {
            let sent = entry
                .outbox
                .as_ref()
                .is_some_and(|o| o.send(MasterFrame::Disconnect).is_ok());
            if !sent {
                entry.kill.cancel();
            }
        }
        tracing::debug!(worker = %id, "disconnect requested");

        if let Some(timeout) = self.cfg.disconnect_deadline() {
            self.post_after(timeout, Command::DisconnectTimeout(id));
        }
    }

    fn disconnect_all(&mut self) {
        for id in self.registry.ids() {
            let Some(entry) = self.registry.get_mut(id) else {
                continue;
            };
            match entry.state() {
                WorkerState::Forking => {
                    entry.requested = true;
                    entry.kill.cancel();
                }
                WorkerState::Online | WorkerState::Listening => self.begin_disconnect(id),
                WorkerState::Disconnecting | WorkerState::Dead => {}
            }
        }
    }

    fn on_disconnect_timeout(&mut self, id: WorkerId) {
        let timeout = self.cfg.disconnect_timeout;
        self.force_kill(id, timeout);
    }

    /// Kills a worker that is still around after `grace`; `error` notice included.
    fn force_kill(&mut self, id: WorkerId, grace: Duration) {
        let Some(entry) = self.registry.get_mut(id) else {
            return;
        };
        if entry.state().is_dead() || entry.forced {
            return;
        }
        entry.forced = true;
        entry.kill.cancel();
        let info = entry.info.clone();
        let err = ClusterError::ForcedTermination { id, grace };
        tracing::warn!(worker = %id, ?grace, "{err}");
        self.emit(Event::new(EventKind::Error).with_worker(info).with_error(err));
    }

    fn destroy(&mut self, reply: Reply<()>) {
        if !self.destroying && self.registry.is_empty() {
            self.reset();
            let _ = reply.send(());
            return;
        }
        self.destroy_waiters.push(reply);
        if self.destroying {
            return;
        }

        self.destroying = true;
        tracing::info!(workers = self.registry.ids().len(), "destroying cluster");
        self.disconnect_all();
        self.post_after(self.cfg.grace, Command::GraceElapsed(self.generation));
    }

    fn on_grace_elapsed(&mut self, generation: u64) {
        if generation != self.generation || !self.destroying {
            return;
        }
        let grace = self.cfg.grace;
        for id in self.registry.ids() {
            self.force_kill(id, grace);
        }
    }

    fn maybe_finish_destroy(&mut self) {
        if !self.destroying || !self.registry.is_empty() {
            return;
        }
        self.reset();
        tracing::info!("cluster destroyed");
        for waiter in self.destroy_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Back to a pristine manager; ids and listeners survive.
    fn reset(&mut self) {
        self.generation += 1;
        self.destroying = false;
        self.auto_target = None;
        self.failures = 0;
        self.halted = false;
        self.ipc = None;
        self.out.settings.send_replace(Settings::default());
        self.publish_online();
    }

    // ---- event bus ----

    fn emit(&mut self, ev: Event) {
        let panics = self.listeners.dispatch(&ev);
        let nested = ev.kind != EventKind::Error;
        self.out.bus.publish(ev);
        if nested {
            for err in panics {
                self.emit(Event::new(EventKind::Error).with_error(err));
            }
        }
    }

    fn post_after(&self, delay: Duration, cmd: Command) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                time::sleep(delay).await;
            }
            let _ = tx.send(cmd);
        });
    }
}
