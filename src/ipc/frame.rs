//! Frame types and the JSON-lines codec helpers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::LinesCodec;

/// Frames sent by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum WorkerFrame {
    Online,
    Listening,
    Message { payload: Value },
    /// Drained; the worker is about to close its channel and exit.
    Disconnect,
}

/// Frames sent by the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum MasterFrame {
    Message { payload: Value },
    /// Stop accepting work, drain, exit.
    Disconnect,
}

/// Line codec bounded to `max_len` bytes per frame.
pub(crate) fn lines_codec(max_len: usize) -> LinesCodec {
    LinesCodec::new_with_max_length(max_len.max(1))
}

pub(crate) fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub(crate) fn decode<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line.trim())
}
