//! Master-side socket directory.

use std::io;
use std::path::PathBuf;

use tempfile::TempDir;
use tokio::net::UnixListener;

use crate::core::WorkerId;

/// Private directory (mode 0700) holding one socket per forking worker.
///
/// Removed with everything in it when dropped.
pub(crate) struct IpcDir {
    dir: TempDir,
}

impl IpcDir {
    pub(crate) fn new() -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("forkvisor-").tempdir()?;
        Ok(Self { dir })
    }

    /// Binds the listening socket for worker `id`.
    pub(crate) fn bind(&self, id: WorkerId) -> io::Result<(UnixListener, PathBuf)> {
        let path = self.dir.path().join(format!("worker-{id}.sock"));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok((listener, path))
    }
}
