//! # Worker-side runtime.
//!
//! A process forked by a [`Cluster`](crate::Cluster) finds its IPC socket and
//! id in the environment. [`connect`] opens the channel and reports `online`;
//! the returned [`WorkerContext`] is the worker's half of the channel.
//!
//! ## Example
//! ```rust,no_run
//! use forkvisor::worker::{self, Incoming};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), forkvisor::WorkerError> {
//!     if forkvisor::is_master() {
//!         return Ok(());
//!     }
//!     let mut ctx = worker::connect().await?;
//!     ctx.listening().await?;
//!     while let Some(incoming) = ctx.recv().await? {
//!         match incoming {
//!             Incoming::Message(payload) => ctx.send(payload).await?,
//!             Incoming::Disconnect => return ctx.disconnect().await,
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::io::ErrorKind;
use std::path::PathBuf;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use crate::core::WorkerId;
use crate::error::WorkerError;
use crate::ipc::{ENV_IPC_PATH, ENV_WORKER_ID, MasterFrame, WorkerFrame, decode, encode, lines_codec};

/// Longest frame a worker accepts from the master.
const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// `true` when this process was forked by a forkvisor master.
pub fn is_worker() -> bool {
    std::env::var_os(ENV_WORKER_ID).is_some()
}

/// `true` when this process was not forked by a forkvisor master.
pub fn is_master() -> bool {
    !is_worker()
}

/// What the master sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Payload passed to `Cluster::message` / `Worker::send`.
    Message(Value),
    /// The master asks the worker to drain and exit.
    Disconnect,
}

/// Worker half of the IPC channel.
pub struct WorkerContext {
    id: WorkerId,
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
}

/// Connects to the master and reports `online`.
///
/// # Errors
/// [`WorkerError::NotAWorker`] outside a forked worker, [`WorkerError::InvalidEnv`]
/// for an unparsable id, [`WorkerError::Io`] when the socket is unreachable.
pub async fn connect() -> Result<WorkerContext, WorkerError> {
    let raw_id = std::env::var(ENV_WORKER_ID).map_err(|e| match e {
        std::env::VarError::NotPresent => WorkerError::NotAWorker { var: ENV_WORKER_ID },
        std::env::VarError::NotUnicode(_) => WorkerError::InvalidEnv {
            var: ENV_WORKER_ID,
            reason: "not unicode".into(),
        },
    })?;
    let id = raw_id
        .trim()
        .parse::<u64>()
        .map(WorkerId::new)
        .map_err(|e| WorkerError::InvalidEnv {
            var: ENV_WORKER_ID,
            reason: e.to_string(),
        })?;
    let path = std::env::var_os(ENV_IPC_PATH)
        .map(PathBuf::from)
        .ok_or(WorkerError::NotAWorker { var: ENV_IPC_PATH })?;

    let stream = UnixStream::connect(&path).await?;
    let mut ctx = WorkerContext::new(id, stream);
    ctx.write(&WorkerFrame::Online).await?;
    tracing::debug!(worker = %id, "connected to master");
    Ok(ctx)
}

impl WorkerContext {
    fn new(id: WorkerId, stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            id,
            reader: FramedRead::new(read_half, lines_codec(MAX_FRAME_LEN)),
            writer: FramedWrite::new(write_half, LinesCodec::new()),
        }
    }

    /// Id assigned by the master.
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Sends a payload; the master sees it as a `message` event.
    ///
    /// # Errors
    /// [`WorkerError::Closed`] once the master dropped the channel.
    pub async fn send(&mut self, payload: impl Into<Value>) -> Result<(), WorkerError> {
        self.write(&WorkerFrame::Message {
            payload: payload.into(),
        })
        .await
    }

    /// Reports that the worker accepts work.
    pub async fn listening(&mut self) -> Result<(), WorkerError> {
        self.write(&WorkerFrame::Listening).await
    }

    /// Next frame from the master; `None` once the master closed the channel.
    pub async fn recv(&mut self) -> Result<Option<Incoming>, WorkerError> {
        loop {
            let Some(line) = self.reader.next().await else {
                return Ok(None);
            };
            let line = line.map_err(|e| WorkerError::Codec(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame = decode::<MasterFrame>(&line).map_err(|e| WorkerError::Codec(e.to_string()))?;
            return Ok(Some(match frame {
                MasterFrame::Message { payload } => Incoming::Message(payload),
                MasterFrame::Disconnect => Incoming::Disconnect,
            }));
        }
    }

    /// Reports the worker drained and closes the channel.
    ///
    /// The process is expected to exit shortly after.
    pub async fn disconnect(mut self) -> Result<(), WorkerError> {
        self.write(&WorkerFrame::Disconnect).await?;
        SinkExt::<String>::close(&mut self.writer)
            .await
            .map_err(|e| WorkerError::Codec(e.to_string()))
    }

    async fn write(&mut self, frame: &WorkerFrame) -> Result<(), WorkerError> {
        let line = encode(frame).map_err(|e| WorkerError::Codec(e.to_string()))?;
        self.writer.send(line).await.map_err(|e| match e {
            LinesCodecError::Io(io) if is_peer_gone(&io) => WorkerError::Closed,
            LinesCodecError::Io(io) => WorkerError::Io(io),
            other => WorkerError::Codec(other.to_string()),
        })
    }
}

fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::NotConnected
    )
}
