#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use forkvisor::{Cluster, ClusterConfig, Event, EventKind, SetupOptions};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(15);

pub fn echo_worker() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_forkvisor-echo-worker"))
}

pub fn echo_setup() -> SetupOptions {
    SetupOptions::new().exec(echo_worker()).silent(true)
}

pub fn quick_config() -> ClusterConfig {
    ClusterConfig {
        grace: Duration::from_secs(2),
        ..ClusterConfig::default()
    }
}

/// Next event of `kind`, skipping everything else.
pub async fn next_of(rx: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = rx.recv().await.expect("event bus closed");
            if ev.kind == kind {
                return ev;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for `{kind}`"))
}

/// Collects `n` events of `kind`.
pub async fn collect(rx: &mut broadcast::Receiver<Event>, kind: EventKind, n: usize) -> Vec<Event> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        out.push(next_of(rx, kind).await);
    }
    out
}

/// Waits until `online_workers()` equals `n`.
pub async fn wait_online(cluster: &Cluster, n: usize) {
    let mut rx = cluster.watch_online_workers();
    tokio::time::timeout(WAIT, rx.wait_for(|count| *count == n))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} online workers"))
        .expect("control loop stopped");
}
