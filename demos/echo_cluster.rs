//! # Example: Echo Cluster
//!
//! Forks two echo workers, passes each a sentinel argument, sends a nested
//! message to every worker and tears the cluster down once both replied.
//!
//! ```text
//! cargo build --bin forkvisor-echo-worker
//! cargo run --example echo_cluster [-- /path/to/forkvisor-echo-worker]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use forkvisor::{Cluster, ClusterConfig, Event, EventKind, SetupOptions};
use serde_json::json;

/// The echo worker lives next to `target/<profile>/examples/`.
fn echo_worker_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = std::env::args().nth(1) {
        return Ok(PathBuf::from(path));
    }
    let exe = std::env::current_exe()?;
    let profile_dir = exe
        .parent()
        .and_then(|examples| examples.parent())
        .ok_or_else(|| anyhow::anyhow!("cannot locate target directory"))?;
    Ok(profile_dir.join("forkvisor-echo-worker"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let exec = echo_worker_path()?;

    let cluster = Cluster::new(ClusterConfig {
        grace: Duration::from_secs(2),
        ..ClusterConfig::default()
    });
    cluster.on(EventKind::Fork, |ev: &Event| {
        println!("[fork] worker={:?}", ev.worker_id());
    });
    cluster.on(EventKind::Listening, |ev: &Event| {
        println!("[listening] worker={:?}", ev.worker_id());
    });
    cluster.on(EventKind::Message, |ev: &Event| {
        println!("[message] worker={:?} payload={}", ev.worker_id(), ev.payload.as_deref().unwrap_or(&json!(null)));
    });
    cluster.on(EventKind::Exit, |ev: &Event| {
        println!("[exit] worker={:?} kind={:?} status={:?}", ev.worker_id(), ev.exit, ev.status);
    });

    let settings = cluster
        .setup_master(
            SetupOptions::new()
                .exec(exec)
                .args(["custom argument"])
                .workers(2),
        )
        .await?;
    println!("settings: {settings:?}");

    let mut events = cluster.subscribe();
    let workers = cluster.auto_fork(None).await?;
    for w in &workers {
        w.send(json!({"hello": w.id(), "nested": {"list": [1, 2, 3]}})).await?;
    }

    // Each worker echoes its argument and the nested message.
    let mut replies = 0;
    while replies < workers.len() * 2 {
        let ev = events.recv().await?;
        if ev.kind == EventKind::Message {
            replies += 1;
        }
    }
    println!("online workers: {}", cluster.online_workers());

    cluster.destroy().await?;
    println!("destroyed; online workers: {}", cluster.online_workers());
    Ok(())
}
