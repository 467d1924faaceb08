//! Shutdown signalling for the controller loops
//!
//! Both loops hand a [`ShutdownSignal`] to their runtime's graceful-shutdown
//! hook: once it resolves, no new keys are accepted and in-flight reconciles
//! drain before the loop future returns. [`on_termination`] builds the one
//! signal the process needs, fired by SIGTERM or an interrupt.

use tokio::sync::watch;
use tracing::info;

/// Cloneable handle that resolves once shutdown has been requested
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Resolve when shutdown is requested
    ///
    /// A closed channel means the listener task is gone; that also counts
    /// as shutdown.
    pub async fn wait(mut self) {
        let _ = self.receiver.wait_for(|stop| *stop).await;
    }

    #[cfg(test)]
    pub(crate) fn manual() -> (watch::Sender<bool>, ShutdownSignal) {
        let (sender, receiver) = watch::channel(false);
        (sender, ShutdownSignal { receiver })
    }
}

/// Start listening for process termination and return the shutdown handle
///
/// The listener runs for the lifetime of the process; clones of the returned
/// signal all fire together.
pub fn on_termination() -> ShutdownSignal {
    let (sender, receiver) = watch::channel(false);

    tokio::spawn(async move {
        let signal = termination_signal().await;
        info!(signal = signal, "Initiating graceful shutdown");
        let _ = sender.send(true);
    });

    ShutdownSignal { receiver }
}

/// SIGTERM is what Kubernetes sends on pod stop; ctrl_c covers SIGINT
#[cfg(unix)]
async fn termination_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = tokio::signal::ctrl_c() => "SIGINT",
        },
        Err(e) => {
            warn!(error = %e, "Could not register SIGTERM handler, falling back to interrupt only");
            let _ = tokio::signal::ctrl_c().await;
            "SIGINT"
        }
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "interrupt"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_resolves_once_triggered() {
        let (sender, signal) = ShutdownSignal::manual();
        sender.send(true).expect("send shutdown");
        signal.wait().await;
    }

    #[tokio::test]
    async fn clones_fire_together() {
        let (sender, signal) = ShutdownSignal::manual();
        let clone = signal.clone();
        sender.send(true).expect("send shutdown");
        signal.wait().await;
        clone.wait().await;
    }

    #[tokio::test]
    async fn dropped_listener_counts_as_shutdown() {
        let (sender, signal) = ShutdownSignal::manual();
        drop(sender);
        // must not hang
        signal.wait().await;
    }

    #[tokio::test]
    async fn termination_listener_starts_unsignalled() {
        let signal = on_termination();
        let pending = tokio::time::timeout(Duration::from_millis(50), signal.wait()).await;
        assert!(pending.is_err(), "no termination signal was delivered");
    }
}
