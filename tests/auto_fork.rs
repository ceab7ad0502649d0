mod common;

use std::time::Duration;

use common::{WAIT, collect, echo_setup, next_of, quick_config, wait_online};
use forkvisor::{
    BackoffPolicy, Cluster, ClusterConfig, ClusterError, Event, EventKind, ExitKind, ForkMode,
    SetupOptions,
};
use tokio::sync::broadcast;

fn crash_loop_config(max_consecutive_failures: u32) -> ClusterConfig {
    ClusterConfig {
        max_consecutive_failures,
        backoff: BackoffPolicy::immediate(),
        ..quick_config()
    }
}

/// Every event up to and including the `n`th `exit`.
async fn until_exits(rx: &mut broadcast::Receiver<Event>, n: usize) -> Vec<Event> {
    tokio::time::timeout(WAIT, async {
        let mut seen = Vec::new();
        let mut exits = 0;
        while exits < n {
            let ev = rx.recv().await.unwrap();
            if ev.kind == EventKind::Exit {
                exits += 1;
            }
            seen.push(ev);
        }
        seen
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn crashed_workers_are_replaced_until_the_bound() {
    let cluster = Cluster::new(crash_loop_config(2));
    cluster
        .setup_master(echo_setup().args(["--crash"]))
        .await
        .unwrap();
    let mut rx = cluster.subscribe();
    cluster.auto_fork(Some(1)).await.unwrap();

    // Initial worker plus two replacements, each crashing.
    let exits = collect(&mut rx, EventKind::Exit, 3).await;
    assert!(exits.iter().all(|ev| ev.exit == Some(ExitKind::Crash)));

    let halted = next_of(&mut rx, EventKind::Error).await;
    assert!(halted.is_fatal());
    assert_eq!(halted.error, Some(ClusterError::AutoForkHalted { failures: 3 }));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(cluster.workers().await.unwrap().is_empty());
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn spawn_errors_count_as_failures() {
    let cluster = Cluster::new(crash_loop_config(1));
    cluster
        .setup_master(SetupOptions::new().exec("/nonexistent/forkvisor-worker"))
        .await
        .unwrap();
    let mut rx = cluster.subscribe();
    let forked = cluster.auto_fork(Some(1)).await.unwrap();
    assert_eq!(forked.len(), 1);
    assert_eq!(forked[0].pid(), None);

    let exits = collect(&mut rx, EventKind::Exit, 2).await;
    assert!(exits.iter().all(|ev| ev.exit == Some(ExitKind::SpawnError)));
    let fatal = tokio::time::timeout(WAIT, async {
        loop {
            let ev = next_of(&mut rx, EventKind::Error).await;
            if ev.is_fatal() {
                return ev;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(fatal.error, Some(ClusterError::AutoForkHalted { failures: 2 }));
}

#[tokio::test]
async fn requested_exits_are_not_replaced() {
    let cluster = Cluster::new(quick_config());
    cluster.setup_master(echo_setup().workers(2)).await.unwrap();
    let mut rx = cluster.subscribe();
    let workers = cluster.auto_fork(None).await.unwrap();
    wait_online(&cluster, 2).await;

    workers[0].disconnect().await.unwrap();
    let exit = next_of(&mut rx, EventKind::Exit).await;
    assert_eq!(exit.exit, Some(ExitKind::Requested));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let live = cluster.workers().await.unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, workers[1].id());
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn auto_mode_from_settings_replaces_manual_forks() {
    let cluster = Cluster::new(crash_loop_config(1));
    cluster
        .setup_master(
            echo_setup()
                .args(["--crash"])
                .workers(1)
                .fork_mode(ForkMode::Auto),
        )
        .await
        .unwrap();
    let mut rx = cluster.subscribe();

    // No auto_fork call: the target falls back to `settings.workers`.
    let first = cluster.fork().await.unwrap();
    let forks = collect(&mut rx, EventKind::Fork, 2).await;
    assert_eq!(forks[0].worker_id(), Some(first.id()));
    assert!(forks[1].worker_id() > Some(first.id()));

    let halted = next_of(&mut rx, EventKind::Error).await;
    assert_eq!(halted.error, Some(ClusterError::AutoForkHalted { failures: 2 }));
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn workers_that_stay_online_reset_the_failure_count() {
    let cluster = Cluster::new(ClusterConfig {
        healthy_after: Duration::from_millis(100),
        ..crash_loop_config(1)
    });
    // Online for 300ms, never `listening`, then exit 1.
    cluster
        .setup_master(echo_setup().args(["--crash-after-ms", "300"]))
        .await
        .unwrap();
    let mut rx = cluster.subscribe();
    cluster.auto_fork(Some(1)).await.unwrap();

    let seen = until_exits(&mut rx, 4).await;
    assert!(seen.iter().all(|ev| ev.kind != EventKind::Error), "{seen:?}");
    assert_eq!(seen.iter().filter(|ev| ev.kind == EventKind::Online).count(), 4);
    assert!(
        seen.iter()
            .filter(|ev| ev.kind == EventKind::Exit)
            .all(|ev| ev.exit == Some(ExitKind::Crash))
    );
    cluster.destroy().await.unwrap();
}

#[tokio::test]
async fn crashes_above_the_target_do_not_count() {
    let cluster = Cluster::new(crash_loop_config(0));
    cluster.setup_master(echo_setup()).await.unwrap();
    let mut rx = cluster.subscribe();
    cluster.auto_fork(Some(1)).await.unwrap();
    wait_online(&cluster, 1).await;

    // Extra crashing workers on top of the target.
    cluster
        .setup_master(echo_setup().args(["--crash"]))
        .await
        .unwrap();
    assert_eq!(cluster.settings().fork_mode, ForkMode::Auto);
    cluster.fork().await.unwrap();
    cluster.fork().await.unwrap();

    let seen = until_exits(&mut rx, 2).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let late: Vec<Event> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert!(
        seen.iter().chain(&late).all(|ev| ev.kind != EventKind::Error),
        "{seen:?} {late:?}"
    );
    assert_eq!(cluster.workers().await.unwrap().len(), 1);
    cluster.destroy().await.unwrap();
}
