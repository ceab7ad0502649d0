//! # IPC channel between master and workers.
//!
//! One Unix domain socket per worker, bound inside a private temporary
//! directory owned by the manager. The child learns where to connect from its
//! environment:
//!
//! ```text
//! FORKVISOR_WORKER_ID=3
//! FORKVISOR_IPC_PATH=/tmp/forkvisor-Ab12Cd/worker-3.sock
//! ```
//!
//! ## Wire format
//! Newline-delimited JSON, one frame per line, internally tagged by `type`:
//! ```text
//! worker → master   {"type":"online"}
//!                   {"type":"listening"}
//!                   {"type":"message","payload":<any JSON>}
//!                   {"type":"disconnect"}
//! master → worker   {"type":"message","payload":<any JSON>}
//!                   {"type":"disconnect"}
//! ```
//!
//! ## Rules
//! - Frames on one socket are delivered in order; there is no ordering across sockets.
//! - Payloads are opaque JSON values and are never rewritten in transit.

mod endpoint;
mod frame;

pub(crate) use endpoint::IpcDir;
pub(crate) use frame::{MasterFrame, WorkerFrame, decode, encode, lines_codec};

/// Environment variable carrying the worker id.
pub const ENV_WORKER_ID: &str = "FORKVISOR_WORKER_ID";
/// Environment variable carrying the socket path.
pub const ENV_IPC_PATH: &str = "FORKVISOR_IPC_PATH";
