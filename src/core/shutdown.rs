//! # Termination signals for `Cluster::destroy_on_signal`.
//!
//! **Unix:** `SIGINT`, `SIGTERM`, `SIGQUIT`.
//! Anything else only sees Ctrl-C.

/// Completes when the master receives a termination signal.
///
/// Each call registers its own signal streams.
#[cfg(unix)]
pub(crate) async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv()  => tracing::debug!(signal = "SIGINT", "signal received"),
        _ = sigterm.recv() => tracing::debug!(signal = "SIGTERM", "signal received"),
        _ = sigquit.recv() => tracing::debug!(signal = "SIGQUIT", "signal received"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub(crate) async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
