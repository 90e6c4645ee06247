//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to [`ControlSignal`] events on the manager's channel
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Config watchers inject synthetic `Reload` events into the same channel
//! - A second `Terminate` while stopping is a forced stop; the manager decides

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Control events understood by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Stop all proxies, reload configuration and start again.
    Reload,
    /// Stop gracefully; a repeat forces the process down.
    Terminate,
}

/// Forward process signals into `tx` until the receiving side goes away.
#[cfg(unix)]
pub fn spawn_signal_listener(
    tx: mpsc::UnboundedSender<ControlSignal>,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(tokio::spawn(async move {
        loop {
            let (name, event) = tokio::select! {
                _ = hangup.recv() => ("SIGHUP", ControlSignal::Reload),
                _ = terminate.recv() => ("SIGTERM", ControlSignal::Terminate),
                _ = interrupt.recv() => ("SIGINT", ControlSignal::Terminate),
            };
            tracing::info!(signal = name, "Received signal");
            if tx.send(event).is_err() {
                break;
            }
        }
    }))
}

/// Forward Ctrl-C as `Terminate` until the receiving side goes away.
#[cfg(not(unix))]
pub fn spawn_signal_listener(
    tx: mpsc::UnboundedSender<ControlSignal>,
) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!(signal = "ctrl-c", "Received signal");
            if tx.send(ControlSignal::Terminate).is_err() {
                break;
            }
        }
    }))
}
