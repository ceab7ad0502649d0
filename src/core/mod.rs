//! Master-side runtime: registry, worker supervision and the control loop.
//!
//! The public entry point is [`Cluster`]; everything else here is plumbing
//! owned by the control loop.
//!
//! Internal modules:
//! - [`control`]: the single-writer loop applying every cluster command;
//! - [`actor`]: supervises one worker process and its IPC socket;
//! - [`registry`]: worker table and state machine enforcement;
//! - [`builder`]: wires channels and spawns the control loop;
//! - [`shutdown`]: OS signal handling for `destroy_on_signal`.

mod actor;
mod builder;
mod cluster;
mod config;
mod control;
mod registry;
mod shutdown;
mod state;

pub use builder::ClusterBuilder;
pub use cluster::{Cluster, Worker};
pub use config::ClusterConfig;
pub use state::{ExitKind, ExitStatus, WorkerId, WorkerInfo, WorkerState};
