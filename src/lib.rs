//! # forkvisor
//!
//! **Forkvisor** is a process cluster manager for tokio applications.
//!
//! A master process forks a pool of worker processes, hands them their
//! configuration, tracks their lifecycle, relays messages in both directions
//! and tears everything down on request.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   Cluster handle(s)                      Cluster::subscribe()
//!     setup_master / fork / auto_fork            ▲
//!     message / disconnect / destroy             │
//!          │                                     │
//!          ▼  mpsc<Command>                      │
//! ┌────────────────────────────────────────────────────────────────┐
//! │  ControlLoop (single owner of all state)                       │
//! │  - Settings         (watch: settings())                        │
//! │  - Registry         (worker table + state machine)             │
//! │  - online count     (watch: online_workers())                  │
//! │  - ListenerTable    (on / once / off, panic-isolated)          │
//! │  - Bus              (broadcast copy of every event)            │
//! └──────┬──────────────────┬──────────────────┬───────────────────┘
//!        ▼                  ▼                  ▼
//!  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//!  │ WorkerActor │    │ WorkerActor │    │ WorkerActor │   one per worker:
//!  │  Child      │    │  Child      │    │  Child      │   owns the process,
//!  │  socket     │    │  socket     │    │  socket     │   the socket and the
//!  └──────┬──────┘    └──────┬──────┘    └──────┬──────┘   outbox
//!         │ JSON lines       │                  │
//!         ▼ (Unix socket)    ▼                  ▼
//!    worker process     worker process     worker process
//!    worker::connect()
//! ```
//!
//! ### Worker lifecycle
//! ```text
//! fork() ──► forking ──online──► online ──listening──► listening
//!              │                   │                      │
//!              │                   ├──disconnect()────────┤
//!              │                   │                      ▼
//!              │                   │               disconnecting ──► dead (requested)
//!              │                   └─crash / channel break──────────► dead (crash)
//!              └─spawn error─────────────────────────────────────────► dead (spawn_error)
//!
//! auto mode: crash / spawn_error ─► backoff ─► fork() replacement
//!            more than max_consecutive_failures in a row ─► fatal `error`, stop replacing
//! ```
//!
//! ## Features
//! | Area              | Description                                                  | Key types                               |
//! |-------------------|--------------------------------------------------------------|-----------------------------------------|
//! | **Master**        | Configure, fork, message, disconnect, destroy.               | [`Cluster`], [`Worker`]                 |
//! | **Settings**      | Snapshot forked workers are created from.                    | [`Settings`], [`SetupOptions`]          |
//! | **Events**        | Lifecycle notifications with ordered, isolated listeners.    | [`Event`], [`EventKind`], [`Listener`]  |
//! | **Policies**      | Crash replacement and its delays.                            | [`ForkMode`], [`BackoffPolicy`]         |
//! | **Worker side**   | Channel to the master from inside a forked process.          | [`worker::WorkerContext`]               |
//! | **Errors**        | Typed errors with stable labels.                             | [`ClusterError`], [`WorkerError`]       |
//! | **Configuration** | Manager knobs (grace, timeouts, failure bound).              | [`ClusterConfig`]                       |
//!
//! ## Optional features
//! - `logging`: exports [`LogWriter`], a listener that writes every event through `tracing`.
//!
//! ## Example
//! ```rust,no_run
//! use forkvisor::{Cluster, ClusterConfig, Event, EventKind, SetupOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     if forkvisor::is_worker() {
//!         let mut ctx = forkvisor::worker::connect().await?;
//!         ctx.listening().await?;
//!         ctx.send("ready").await?;
//!         while ctx.recv().await?.is_some() {}
//!         return Ok(());
//!     }
//!
//!     let cluster = Cluster::new(ClusterConfig::default());
//!     cluster.on(EventKind::Message, |ev: &Event| {
//!         println!("worker {:?} says {:?}", ev.worker_id(), ev.payload);
//!     });
//!     cluster.setup_master(SetupOptions::new().workers(2)).await?;
//!     cluster.auto_fork(None).await?;
//!
//!     cluster.destroy_on_signal().await?;
//!     Ok(())
//! }
//! ```

#[cfg(not(unix))]
compile_error!("forkvisor talks to workers over Unix domain sockets and supports Unix targets only");

mod core;
mod error;
mod events;
mod ipc;
mod policies;
mod settings;
pub mod worker;

// ---- Public re-exports ----

pub use crate::core::{
    Cluster, ClusterBuilder, ClusterConfig, ExitKind, ExitStatus, Worker, WorkerId, WorkerInfo,
    WorkerState,
};
pub use error::{ClusterError, WorkerError};
pub use events::{Bus, Event, EventKind, Listener, ListenerId};
pub use ipc::{ENV_IPC_PATH, ENV_WORKER_ID};
pub use policies::{BackoffPolicy, ForkMode, Jitter};
pub use settings::{Settings, SetupOptions};
pub use worker::{is_master, is_worker};

#[cfg(feature = "logging")]
pub use events::LogWriter;
