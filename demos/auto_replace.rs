//! # Example: Auto Replace
//!
//! Runs a cluster of workers that crash right after coming online. Auto mode
//! replaces each one with growing delays until the failure bound is hit and
//! a fatal `error` event halts replacement, or until Ctrl-C. Events are
//! printed by `LogWriter`.
//!
//! ```text
//! cargo build --bin forkvisor-echo-worker
//! RUST_LOG=info cargo run --example auto_replace --features logging
//! ```

use std::path::PathBuf;
use std::time::Duration;

use forkvisor::{BackoffPolicy, Cluster, ClusterConfig, EventKind, Jitter, LogWriter, SetupOptions};
use tracing_subscriber::EnvFilter;

fn echo_worker_path() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let profile_dir = exe
        .parent()
        .and_then(|examples| examples.parent())
        .ok_or_else(|| anyhow::anyhow!("cannot locate target directory"))?;
    Ok(profile_dir.join("forkvisor-echo-worker"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = ClusterConfig {
        max_consecutive_failures: 4,
        backoff: BackoffPolicy {
            first: Duration::from_millis(50),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: Jitter::Equal,
        },
        ..ClusterConfig::default()
    };
    let cluster = Cluster::builder(cfg).with_any_listener(LogWriter::new()).build();

    cluster
        .setup_master(
            SetupOptions::new()
                .exec(echo_worker_path()?)
                .args(["--crash", "about to crash"]),
        )
        .await?;

    let mut events = cluster.subscribe();
    cluster.auto_fork(Some(2)).await?;

    let halted = async {
        loop {
            let ev = events.recv().await?;
            if ev.kind == EventKind::Error && ev.is_fatal() {
                return anyhow::Ok(());
            }
        }
    };

    // Ctrl-C tears the cluster down early.
    tokio::select! {
        res = halted => {
            res?;
            cluster.destroy().await?;
        }
        res = cluster.destroy_on_signal() => res?,
    }
    Ok(())
}
