//! Graceful shutdown for the bridge.
//!
//! A [`ShutdownHandle`] is cloneable: the binary hands one clone to the
//! coordinator and triggers another from the signal listener, tests trigger
//! it directly.
//!
//! ## Usage
//!
//! ```ignore
//! let shutdown = ShutdownHandle::new();
//! shutdown.listen_for_signals();
//! let outcome = coordinator.with_shutdown(shutdown.clone()).run().await;
//! ```

use tokio::sync::watch;
use tracing::{info, warn};

/// What asked the bridge to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Received SIGINT (Ctrl+C)
    SigInt,
    /// Received SIGTERM
    SigTerm,
    /// Requested through [`ShutdownHandle::shutdown`]
    Manual,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SigInt => write!(f, "SIGINT (Ctrl+C)"),
            Self::SigTerm => write!(f, "SIGTERM"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Handle for triggering and monitoring shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<Option<ShutdownSignal>>,
    receiver: watch::Receiver<Option<ShutdownSignal>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(None);
        Self { sender, receiver }
    }

    /// Request a manual shutdown.
    pub fn shutdown(&self) {
        self.trigger(ShutdownSignal::Manual);
    }

    /// Request shutdown on behalf of `signal`. Only the first request is kept.
    pub fn trigger(&self, signal: ShutdownSignal) {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(signal);
                true
            } else {
                false
            }
        });
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&mut self) -> ShutdownSignal {
        loop {
            if let Some(signal) = *self.receiver.borrow() {
                return signal;
            }
            if self.receiver.changed().await.is_err() {
                return ShutdownSignal::Manual;
            }
        }
    }

    /// Check if shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.receiver.borrow().is_some()
    }

    /// Spawn a task that triggers this handle on SIGINT or SIGTERM.
    pub fn listen_for_signals(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            let signal = shutdown_signal().await;
            info!(%signal, "Received shutdown signal");
            handle.trigger(signal);
        });
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete when SIGINT or SIGTERM is received.
///
/// If a handler cannot be installed, that signal is never reported.
pub async fn shutdown_signal() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
        ShutdownSignal::SigInt
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
        ShutdownSignal::SigTerm
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<ShutdownSignal>();

    tokio::select! {
        signal = ctrl_c => signal,
        signal = terminate => signal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_shutdown_signal_display() {
        assert_eq!(format!("{}", ShutdownSignal::SigInt), "SIGINT (Ctrl+C)");
        assert_eq!(format!("{}", ShutdownSignal::SigTerm), "SIGTERM");
        assert_eq!(format!("{}", ShutdownSignal::Manual), "manual");
    }

    #[test]
    fn test_shutdown_handle() {
        let handle = ShutdownHandle::new();
        assert!(!handle.is_shutdown());

        handle.shutdown();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_first_signal_wins() {
        let handle = ShutdownHandle::new();
        handle.trigger(ShutdownSignal::SigTerm);
        handle.shutdown();
        assert_eq!(*handle.receiver.borrow(), Some(ShutdownSignal::SigTerm));
    }

    #[tokio::test]
    async fn test_wait_wakes_clones() {
        let handle = ShutdownHandle::new();
        let mut waiter = handle.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.trigger(ShutdownSignal::SigInt);
        assert_eq!(task.await.unwrap(), ShutdownSignal::SigInt);
    }
}
