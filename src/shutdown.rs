//! Process signals that stop the worker.

use std::fmt;
use tracing::info;

#[cfg(unix)]
use tokio::signal::unix::{signal as unix_signal, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM from the container runtime.
    Terminate,
    /// SIGINT, usually Ctrl+C.
    Interrupt,
    Quit,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
        }
    }
}

/// Waits for the first shutdown signal.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut sigint = unix_signal(SignalKind::interrupt())?;
    let mut sigquit = unix_signal(SignalKind::quit())?;

    info!("Listening for SIGTERM, SIGINT and SIGQUIT");

    let received = tokio::select! {
        _ = sigterm.recv() => ShutdownSignal::Terminate,
        _ = sigint.recv() => ShutdownSignal::Interrupt,
        _ = sigquit.recv() => ShutdownSignal::Quit,
    };
    Ok(received)
}

#[cfg(not(unix))]
pub async fn wait_for_signal() -> std::io::Result<ShutdownSignal> {
    info!("Listening for Ctrl+C");
    tokio::signal::ctrl_c().await?;
    Ok(ShutdownSignal::Interrupt)
}
