//! # WorkerActor: supervision task of one worker process.
//!
//! Owns the [`Child`], the worker's listening socket and the outbox of frames
//! queued by the control loop. Everything it observes is reported back as a
//! [`WorkerReport`]; it never touches the registry itself.
//!
//! ## Flow
//! ```text
//! spawn ──► accept() ─────────────► Connected
//!   │          │
//!   │          └─► loop {
//!   │                ├─► reader.next()  ──► Frame / ChannelClosed
//!   │                ├─► outbox.recv()  ──► writer.send(line)
//!   │                ├─► kill token     ──► child.start_kill()
//!   │                └─► child.wait()   ──► break
//!   │              }
//!   │              drain buffered frames (bounded wait)
//!   └──────────────────────────────► Exited(status)
//! ```
//!
//! ## Rules
//! - `Exited` is the last report of an actor and is sent exactly once.
//! - Frames the worker wrote before exiting are reported before `Exited`;
//!   a connection still queued when the process exits is accepted first.
//! - Dropping the outbox sender closes the write half, which the worker sees as EOF.

use std::process::Stdio;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::{select, time};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;

use crate::core::control::Command;
use crate::core::{ExitStatus, WorkerId};
use crate::ipc::{MasterFrame, WorkerFrame, decode, encode, lines_codec};

/// Upper bound for reading frames left in the socket after the process exited.
const DRAIN_WINDOW: Duration = Duration::from_millis(250);

/// What a worker actor tells the control loop.
#[derive(Debug)]
pub(crate) enum WorkerReport {
    /// The worker connected to its socket.
    Connected(WorkerId),
    /// A decoded frame, in arrival order.
    Frame(WorkerId, WorkerFrame),
    /// EOF, I/O error or an undecodable frame on the read half.
    ChannelClosed(WorkerId),
    /// The process was reaped.
    Exited(WorkerId, ExitStatus),
}

/// Stdio wiring for the child, derived from `Settings::silent`.
pub(crate) fn stdio(silent: bool) -> (Stdio, Stdio, Stdio) {
    if silent {
        (Stdio::null(), Stdio::piped(), Stdio::piped())
    } else {
        (Stdio::inherit(), Stdio::inherit(), Stdio::inherit())
    }
}

pub(crate) struct WorkerActor {
    id: WorkerId,
    child: Child,
    listener: UnixListener,
    outbox: mpsc::UnboundedReceiver<MasterFrame>,
    kill: CancellationToken,
    reports: mpsc::UnboundedSender<Command>,
    max_frame_len: usize,
}

impl WorkerActor {
    pub(crate) fn new(
        id: WorkerId,
        child: Child,
        listener: UnixListener,
        outbox: mpsc::UnboundedReceiver<MasterFrame>,
        kill: CancellationToken,
        reports: mpsc::UnboundedSender<Command>,
        max_frame_len: usize,
    ) -> Self {
        Self {
            id,
            child,
            listener,
            outbox,
            kill,
            reports,
            max_frame_len,
        }
    }

    /// Supervises the worker until its process is reaped.
    pub(crate) async fn run(mut self) {
        self.forward_stdio();

        let mut killed = false;
        let stream = loop {
            select! {
                biased;
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => break Some(stream),
                    Err(e) => {
                        tracing::warn!(worker = %self.id, error = %e, "ipc accept failed");
                        break None;
                    }
                },
                _ = self.kill.cancelled(), if !killed => {
                    killed = true;
                    self.start_kill();
                }
                status = self.child.wait() => {
                    self.report_exit(status);
                    return;
                }
            }
        };

        let Some(stream) = stream else {
            self.report(WorkerReport::ChannelClosed(self.id));
            let status = self.wait_reaped(killed).await;
            self.report_exit(status);
            return;
        };

        self.report(WorkerReport::Connected(self.id));
        self.supervise(stream, killed).await;
    }

    async fn supervise(&mut self, stream: UnixStream, mut killed: bool) {
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, lines_codec(self.max_frame_len));
        let mut writer = Some(FramedWrite::new(write_half, LinesCodec::new()));
        let mut reading = true;

        let status = loop {
            select! {
                line = reader.next(), if reading => {
                    if !report_line(self.id, &self.reports, line) {
                        reading = false;
                        self.report(WorkerReport::ChannelClosed(self.id));
                    }
                }
                frame = self.outbox.recv(), if writer.is_some() => match frame {
                    Some(frame) => {
                        if let Some(w) = writer.as_mut() {
                            if let Err(e) = write_frame(w, &frame).await {
                                tracing::debug!(worker = %self.id, error = %e, "ipc write failed");
                                writer = None;
                            }
                        }
                    }
                    None => {
                        if let Some(mut w) = writer.take() {
                            let _ = SinkExt::<String>::close(&mut w).await;
                        }
                    }
                },
                _ = self.kill.cancelled(), if !killed => {
                    killed = true;
                    self.start_kill();
                }
                status = self.child.wait() => break status,
            }
        };

        if reading {
            let (id, reports) = (self.id, &self.reports);
            let drained = time::timeout(DRAIN_WINDOW, async {
                while let Some(line) = reader.next().await {
                    if !report_line(id, reports, Some(line)) {
                        break;
                    }
                }
            })
            .await;
            if drained.is_err() {
                tracing::debug!(worker = %self.id, "gave up draining ipc after exit");
            }
        }
        self.report_exit(status);
    }

    async fn wait_reaped(&mut self, mut killed: bool) -> std::io::Result<std::process::ExitStatus> {
        loop {
            select! {
                _ = self.kill.cancelled(), if !killed => {
                    killed = true;
                    self.start_kill();
                }
                status = self.child.wait() => return status,
            }
        }
    }

    fn start_kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(worker = %self.id, error = %e, "kill failed");
        }
    }

    fn report_exit(&self, status: std::io::Result<std::process::ExitStatus>) {
        let status = match status {
            Ok(status) => ExitStatus::from(status),
            Err(e) => {
                tracing::error!(worker = %self.id, error = %e, "wait failed");
                ExitStatus::default()
            }
        };
        self.report(WorkerReport::Exited(self.id, status));
    }

    fn report(&self, report: WorkerReport) {
        let _ = self.reports.send(Command::Report(report));
    }

    /// Forwards piped stdout/stderr into the log at debug level.
    fn forward_stdio(&mut self) {
        if let Some(out) = self.child.stdout.take() {
            tokio::spawn(forward_lines(self.id, "stdout", out));
        }
        if let Some(err) = self.child.stderr.take() {
            tokio::spawn(forward_lines(self.id, "stderr", err));
        }
    }
}

/// Reports one read result; `false` once the read half is unusable.
fn report_line(
    id: WorkerId,
    reports: &mpsc::UnboundedSender<Command>,
    line: Option<Result<String, LinesCodecError>>,
) -> bool {
    match line {
        Some(Ok(line)) if line.trim().is_empty() => true,
        Some(Ok(line)) => match decode::<WorkerFrame>(&line) {
            Ok(frame) => {
                let _ = reports.send(Command::Report(WorkerReport::Frame(id, frame)));
                true
            }
            Err(e) => {
                tracing::warn!(worker = %id, error = %e, "malformed frame");
                false
            }
        },
        Some(Err(e)) => {
            tracing::warn!(worker = %id, error = %e, "ipc read failed");
            false
        }
        None => false,
    }
}

async fn write_frame(
    writer: &mut FramedWrite<tokio::net::unix::OwnedWriteHalf, LinesCodec>,
    frame: &MasterFrame,
) -> std::io::Result<()> {
    let line = encode(frame).map_err(std::io::Error::other)?;
    writer.send(line).await.map_err(std::io::Error::other)
}

async fn forward_lines<R>(id: WorkerId, stream: &'static str, pipe: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(worker = %id, stream, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcDir;

    fn spawn_sh(script: &str) -> Child {
        tokio::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    async fn next_report(rx: &mut mpsc::UnboundedReceiver<Command>) -> WorkerReport {
        match rx.recv().await {
            Some(Command::Report(r)) => r,
            _ => panic!("expected a worker report"),
        }
    }

    #[tokio::test]
    async fn unconnected_exit_is_reported() {
        let dir = IpcDir::new().unwrap();
        let id = WorkerId::new(1);
        let (listener, _path) = dir.bind(id).unwrap();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let actor = WorkerActor::new(
            id,
            spawn_sh("exit 7"),
            listener,
            out_rx,
            CancellationToken::new(),
            tx,
            1024,
        );
        tokio::spawn(actor.run());

        match next_report(&mut rx).await {
            WorkerReport::Exited(got, status) => {
                assert_eq!(got, id);
                assert_eq!(status.code, Some(7));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn kill_token_terminates_the_process() {
        let dir = IpcDir::new().unwrap();
        let id = WorkerId::new(2);
        let (listener, _path) = dir.bind(id).unwrap();
        let (_out_tx, out_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let actor = WorkerActor::new(id, spawn_sh("sleep 30"), listener, out_rx, kill.clone(), tx, 1024);
        tokio::spawn(actor.run());

        kill.cancel();
        match next_report(&mut rx).await {
            WorkerReport::Exited(_, status) => {
                assert_eq!(status.code, None);
                assert_eq!(status.signal, Some(9));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
