//! # LogWriter: cluster events through `tracing`.
//!
//! A minimal listener that writes every event it receives as a `tracing`
//! record under the `forkvisor::events` target. Attach it with
//! [`Cluster::on_any`](crate::Cluster::on_any) or the builder.
//!
//! ## Example output (fmt subscriber)
//! ```text
//! INFO forkvisor::events: [setup] workers=4 exec="/srv/app" fork_mode=manual
//! INFO forkvisor::events: [fork] worker=1 pid=Some(4242)
//! INFO forkvisor::events: [online] worker=1
//! WARN forkvisor::events: [exit] worker=1 kind=crash status=Some(ExitStatus { code: Some(3), signal: None })
//! ERROR forkvisor::events: [error] worker=None fatal=true error=auto-fork halted after 6 consecutive failures
//! ```

use crate::events::{Event, EventKind, Listener};

/// Event writer listener.
#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    /// Construct a new [`LogWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Listener for LogWriter {
    fn on_event(&self, e: &Event) {
        let worker = e.worker_id().map(|id| id.get());
        match e.kind {
            EventKind::Setup => {
                if let Some(s) = &e.settings {
                    tracing::info!(
                        target: "forkvisor::events",
                        "[setup] workers={} exec={:?} fork_mode={}",
                        s.workers, s.exec, s.fork_mode
                    );
                }
            }
            EventKind::Fork => {
                let pid = e.worker.as_ref().and_then(|w| w.pid);
                tracing::info!(target: "forkvisor::events", "[fork] worker={worker:?} pid={pid:?}");
            }
            EventKind::Online | EventKind::Listening | EventKind::Disconnect => {
                tracing::info!(target: "forkvisor::events", "[{}] worker={worker:?}", e.kind);
            }
            EventKind::Message => {
                tracing::debug!(
                    target: "forkvisor::events",
                    "[message] worker={worker:?} payload={:?}",
                    e.payload
                );
            }
            EventKind::Exit => match e.exit {
                Some(kind) if kind.is_failure() => tracing::warn!(
                    target: "forkvisor::events",
                    "[exit] worker={worker:?} kind={} status={:?}",
                    kind.as_str(),
                    e.status
                ),
                kind => tracing::info!(
                    target: "forkvisor::events",
                    "[exit] worker={worker:?} kind={:?} status={:?}",
                    kind.map(|k| k.as_str()),
                    e.status
                ),
            },
            EventKind::Error => {
                let fatal = e.is_fatal();
                let error = e.error.as_ref().map(ToString::to_string).unwrap_or_default();
                if fatal {
                    tracing::error!(target: "forkvisor::events", "[error] worker={worker:?} fatal=true error={error}");
                } else {
                    tracing::warn!(target: "forkvisor::events", "[error] worker={worker:?} fatal=false error={error}");
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "LogWriter"
    }
}
