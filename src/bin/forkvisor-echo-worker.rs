//! Echo worker used by the integration tests and demos.
//!
//! ```text
//! forkvisor-echo-worker [--crash | --crash-after-ms MS | --hang] [ARG]
//! ```
//!
//! - sends `ARG` (as a string) right after connecting, if given
//! - `--crash`: exits with code 3 right after that, without `listening`
//! - `--crash-after-ms MS`: stays `online` for `MS` milliseconds, never
//!   reports `listening`, then exits with code 1
//! - otherwise reports `listening` and echoes every message back
//! - on `disconnect`: reports drained and exits 0, unless `--hang` is set,
//!   in which case the request is ignored and the process waits to be killed

use std::process::ExitCode;
use std::time::Duration;

use forkvisor::WorkerError;
use forkvisor::worker::{self, Incoming};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Mode {
    crash: bool,
    crash_after: Option<Duration>,
    hang: bool,
    echo: Option<String>,
}

impl Mode {
    fn from_args(mut args: impl Iterator<Item = String>) -> Self {
        let mut mode = Mode::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--crash" => mode.crash = true,
                "--crash-after-ms" => {
                    mode.crash_after = args
                        .next()
                        .and_then(|ms| ms.parse().ok())
                        .map(Duration::from_millis);
                }
                "--hang" => mode.hang = true,
                _ if mode.echo.is_none() => mode.echo = Some(arg),
                _ => {}
            }
        }
        mode
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mode = Mode::from_args(std::env::args().skip(1));
    match run(mode).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(label = e.as_label(), error = %e, "echo worker failed");
            ExitCode::from(2)
        }
    }
}

async fn run(mode: Mode) -> Result<ExitCode, WorkerError> {
    let mut ctx = worker::connect().await?;
    if let Some(echo) = mode.echo {
        ctx.send(echo).await?;
    }
    if mode.crash {
        tracing::info!(worker = %ctx.id(), "crashing on purpose");
        return Ok(ExitCode::from(3));
    }
    if let Some(uptime) = mode.crash_after {
        tokio::time::sleep(uptime).await;
        tracing::info!(worker = %ctx.id(), ?uptime, "crashing after serving");
        return Ok(ExitCode::from(1));
    }
    ctx.listening().await?;

    while let Some(incoming) = ctx.recv().await? {
        match incoming {
            Incoming::Message(payload) => ctx.send(payload).await?,
            Incoming::Disconnect if mode.hang => {
                tracing::info!(worker = %ctx.id(), "ignoring disconnect");
            }
            Incoming::Disconnect => {
                ctx.disconnect().await?;
                return Ok(ExitCode::SUCCESS);
            }
        }
    }
    if mode.hang {
        std::future::pending::<()>().await;
    }
    Ok(ExitCode::SUCCESS)
}
